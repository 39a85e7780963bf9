//! Transactions and internal subtransactions.
//!
//! The host keeps a stack of transaction levels per thread. Level 1 is the
//! top-level transaction and every internal subtransaction adds one more.
//! Each level owns a memory context, current while the level is innermost,
//! and a snapshot of the catalog taken when it began.
//!
//! Releasing a subtransaction keeps its effects: its context stays alive
//! under the parent level until the top-level transaction ends. Rolling it
//! back puts the catalog snapshot back and deletes its context.

use std::cell::RefCell;

use crate::catalog::{self, CatalogSnapshot};
use crate::elog::{self, SqlState};
use crate::memory::{self, MemoryContext};

struct Level {
    name: Option<String>,
    context: MemoryContext,
    // Current when the level began; current again when it ends.
    saved_context: MemoryContext,
    snapshot: CatalogSnapshot,
}

thread_local! {
    static LEVELS: RefCell<Vec<Level>> = const { RefCell::new(Vec::new()) };
}

fn with_levels<R>(f: impl FnOnce(&mut Vec<Level>) -> R) -> R {
    LEVELS.with(|levels| f(&mut levels.borrow_mut()))
}

fn push_level(name: Option<&str>, parent: MemoryContext, context_name: &str) {
    let context = memory::alloc_set_context_create(parent, context_name);
    let saved_context = memory::memory_context_switch_to(context);
    with_levels(|levels| {
        levels.push(Level {
            name: name.map(str::to_owned),
            context,
            saved_context,
            snapshot: catalog::snapshot(),
        })
    });
}

/// Ends the innermost level; its catalog changes stay unless `rollback`.
fn pop_level(rollback: bool) {
    let Some(level) = with_levels(Vec::pop) else {
        return;
    };

    memory::memory_context_switch_to(level.saved_context);
    if rollback {
        catalog::restore(level.snapshot);
        memory::memory_context_delete(level.context);
    }
}

/// Number of open levels: 0 outside a transaction, 1 in a top-level
/// transaction, more inside subtransactions.
pub fn get_current_transaction_nest_level() -> usize {
    with_levels(|levels| levels.len())
}

/// Whether a transaction is open.
pub fn is_transaction_state() -> bool {
    get_current_transaction_nest_level() > 0
}

/// Memory context of the innermost level.
pub fn cur_transaction_context() -> Option<MemoryContext> {
    with_levels(|levels| levels.last().map(|level| level.context))
}

/// Name the innermost subtransaction was begun with.
pub fn current_sub_transaction_name() -> Option<String> {
    with_levels(|levels| match levels.as_slice() {
        [_, .., level] => level.name.clone(),
        _ => None,
    })
}

/// Opens the top-level transaction.
#[track_caller]
pub fn start_transaction_command() {
    if is_transaction_state() {
        elog::error(
            SqlState::INVALID_TRANSACTION_STATE,
            "there is already a transaction in progress",
        );
    }
    push_level(None, memory::top_memory_context(), "TopTransactionContext");
}

/// Commits the top-level transaction.
///
/// Raises when no transaction is open or a subtransaction is still active.
#[track_caller]
pub fn commit_transaction_command() {
    match get_current_transaction_nest_level() {
        0 => elog::error(
            SqlState::NO_ACTIVE_SQL_TRANSACTION,
            "there is no transaction in progress",
        ),
        1 => {
            let context = cur_transaction_context();
            pop_level(false);
            if let Some(context) = context {
                memory::memory_context_delete(context);
            }
        }
        _ => elog::error(
            SqlState::INVALID_TRANSACTION_STATE,
            "cannot commit while a subtransaction is active",
        ),
    }
}

/// Rolls back every open level, subtransactions included.
pub fn abort_current_transaction() {
    while is_transaction_state() {
        pop_level(true);
    }
}

/// Opens a subtransaction inside the current transaction and makes its
/// memory context current.
#[track_caller]
pub fn begin_internal_sub_transaction(name: Option<&str>) {
    let Some(parent) = cur_transaction_context() else {
        elog::error(
            SqlState::NO_ACTIVE_SQL_TRANSACTION,
            "cannot start a subtransaction outside a transaction",
        );
    };
    push_level(name, parent, "CurTransactionContext");
}

#[track_caller]
fn require_subtransaction() {
    if get_current_transaction_nest_level() < 2 {
        elog::error(
            SqlState::NO_ACTIVE_SQL_TRANSACTION,
            "there is no subtransaction in progress",
        );
    }
}

/// Ends the innermost subtransaction, keeping its effects.
#[track_caller]
pub fn release_current_sub_transaction() {
    require_subtransaction();
    pop_level(false);
}

/// Ends the innermost subtransaction, undoing its effects.
#[track_caller]
pub fn rollback_and_release_current_sub_transaction() {
    require_subtransaction();
    pop_level(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INVALID_OID;

    #[test]
    fn test_levels_nest() {
        assert!(!is_transaction_state());
        let outside = memory::current_memory_context();

        start_transaction_command();
        let top = memory::current_memory_context();
        assert_eq!(cur_transaction_context(), Some(top));

        begin_internal_sub_transaction(Some("inner"));
        assert_eq!(get_current_transaction_nest_level(), 2);
        assert_eq!(current_sub_transaction_name().as_deref(), Some("inner"));
        assert_eq!(memory::memory_context_parent(memory::current_memory_context()), Some(top));

        release_current_sub_transaction();
        assert_eq!(memory::current_memory_context(), top);
        commit_transaction_command();

        assert!(!is_transaction_state());
        assert_eq!(memory::current_memory_context(), outside);
        assert!(!memory::memory_context_is_valid(top));
    }

    #[test]
    fn test_rollback_restores_catalog() {
        start_transaction_command();
        begin_internal_sub_transaction(None);
        let sub = memory::current_memory_context();
        catalog::create_role("temporary");

        rollback_and_release_current_sub_transaction();
        assert_eq!(catalog::get_role_oid("temporary", true), INVALID_OID);
        assert!(!memory::memory_context_is_valid(sub));

        begin_internal_sub_transaction(None);
        let kept = catalog::create_role("kept");
        release_current_sub_transaction();
        assert_eq!(catalog::get_role_oid("kept", true), kept);

        abort_current_transaction();
        assert_eq!(catalog::get_role_oid("kept", true), INVALID_OID);
        assert!(!is_transaction_state());
    }
}
