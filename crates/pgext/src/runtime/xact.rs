//! Transactions and subtransactions as scopes.
//!
//! A [`Transaction`] or [`Subtransaction`] begins a level when it is made
//! and ends it exactly once, either through `commit`/`rollback` or on drop
//! in the mode it was made with. [`Subtransaction::run`] ties the outcome
//! to a closure: `Ok` commits, while an `Err` or a host ERROR raised inside
//! rolls back.
//!
//! Rolling back a subtransaction also rolls back any level opened inside it
//! and left open. Committing requires the subtransaction to be innermost.

use std::marker::PhantomData;

use pgext_host::xact;
use pgext_log::{debug, warn};

use super::guard::ffi_guard;
use crate::{Error, Result};

/// A top-level transaction.
///
/// Made inside a transaction that is already open, it joins that one and
/// never ends it.
#[must_use = "the transaction ends when this is dropped"]
#[derive(Debug)]
pub struct Transaction {
    started: bool,
    commit_on_drop: bool,
    done: bool,
    _thread: PhantomData<*const ()>,
}

impl Transaction {
    /// Begins a transaction that rolls back unless committed.
    pub fn begin() -> Result<Self> {
        Self::new(false)
    }

    /// Begins a transaction that commits on drop when `commit_on_drop`.
    pub fn new(commit_on_drop: bool) -> Result<Self> {
        let started = !xact::is_transaction_state();
        if started {
            ffi_guard(xact::start_transaction_command)?;
            debug!("started transaction");
        }
        Ok(Transaction {
            started,
            commit_on_drop,
            done: false,
            _thread: PhantomData,
        })
    }

    /// Whether this scope opened the transaction rather than joined it.
    pub fn is_owner(&self) -> bool {
        self.started
    }

    pub fn commit(mut self) -> Result<()> {
        self.end(true)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.end(false)
    }

    fn end(&mut self, commit: bool) -> Result<()> {
        self.done = true;
        if !self.started {
            return Ok(());
        }
        if commit {
            ffi_guard(xact::commit_transaction_command)?;
        } else {
            xact::abort_current_transaction();
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(err) = self.end(self.commit_on_drop) {
            warn!("failed to end transaction: {err}");
            xact::abort_current_transaction();
        }
    }
}

/// An internal subtransaction of the current transaction.
#[must_use = "the subtransaction ends when this is dropped"]
#[derive(Debug)]
pub struct Subtransaction {
    level: usize,
    commit_on_drop: bool,
    done: bool,
    _thread: PhantomData<*const ()>,
}

impl Subtransaction {
    /// Begins a subtransaction that rolls back unless committed.
    pub fn begin() -> Result<Self> {
        Self::begin_with(None, false)
    }

    /// Begins a named subtransaction that commits on drop when
    /// `commit_on_drop`.
    pub fn begin_with(name: Option<&str>, commit_on_drop: bool) -> Result<Self> {
        ffi_guard(|| xact::begin_internal_sub_transaction(name))?;
        let level = xact::get_current_transaction_nest_level();
        debug!("began subtransaction at level {level}");
        Ok(Subtransaction {
            level,
            commit_on_drop,
            done: false,
            _thread: PhantomData,
        })
    }

    /// Runs `f` in a new subtransaction, committing it if `f` succeeds.
    ///
    /// A host ERROR raised by `f` is captured and returned as
    /// [`Error::Host`] after the rollback.
    pub fn run<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
        Self::run_named(None, f)
    }

    pub fn run_named<R>(name: Option<&str>, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let sub = Self::begin_with(name, false)?;
        match ffi_guard(f).unwrap_or_else(|capture| Err(Error::Host(capture))) {
            Ok(value) => {
                sub.commit()?;
                Ok(value)
            }
            Err(err) => {
                sub.rollback()?;
                Err(err)
            }
        }
    }

    /// Nest level this subtransaction runs at.
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn commit(mut self) -> Result<()> {
        self.end(true)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.end(false)
    }

    fn end(&mut self, commit: bool) -> Result<()> {
        self.done = true;
        let current = xact::get_current_transaction_nest_level();
        if current < self.level || (commit && current != self.level) {
            return Err(Error::SubtransactionOrder {
                expected: self.level,
                current,
            });
        }

        if commit {
            ffi_guard(xact::release_current_sub_transaction)?;
        } else {
            while xact::get_current_transaction_nest_level() >= self.level {
                ffi_guard(xact::rollback_and_release_current_sub_transaction)?;
            }
        }
        Ok(())
    }
}

impl Drop for Subtransaction {
    fn drop(&mut self) {
        if !self.done {
            if let Err(err) = self.end(self.commit_on_drop) {
                warn!("failed to end subtransaction at level {}: {err}", self.level);
            }
        }
    }
}
