// Integration tests for the host-thread worker
//
// Threads other than the host's own post closures; the worker runs them on
// the host thread, where host state is reachable.

use std::thread;

use pgext::host::catalog;
use pgext::host::elog::{self, SqlState};
use pgext::{Error, Role, Worker};

// ============================================================================
// Posting from other threads
// ============================================================================

mod posting_tests {
    use super::*;

    #[test]
    fn test_tasks_from_spawned_thread_run_on_host() {
        let host = thread::current().id();
        let (worker, handle) = Worker::new();

        let poster = thread::spawn(move || {
            let tasks: Vec<_> = (0..100_u32)
                .map(|i| {
                    handle.post(move || {
                        let oid = catalog::create_role(&format!("worker_role_{i}"));
                        (i, oid, thread::current().id())
                    })
                })
                .collect();
            handle.terminate();
            tasks
                .into_iter()
                .map(|task| task.wait().map_err(|err| err.to_string()))
                .collect::<Result<Vec<_>, String>>()
        });

        assert_eq!(worker.run(), 100);
        let results = poster.join().unwrap().unwrap();

        assert_eq!(results.iter().map(|(i, _, _)| i).sum::<u32>(), 4950);
        assert!(results.iter().all(|(_, _, id)| *id == host));
        for (i, oid, _) in &results {
            let role = Role::from_name(&format!("worker_role_{i}")).unwrap();
            assert_eq!(role.oid(), *oid);
        }
    }

    #[test]
    fn test_host_error_fails_only_its_task() {
        let (worker, handle) = Worker::new();

        let poster = thread::spawn(move || {
            let missing = handle.post(|| Role::from_name("nobody_at_all").is_ok());
            let raised = handle.post(|| -> u32 {
                elog::error(SqlState::UNDEFINED_OBJECT, "raised on the host")
            });
            let fine = handle.post(catalog::get_user_id);
            handle.terminate();
            let text = |err: Error| err.to_string();
            (
                missing.wait().map_err(text),
                raised.wait().map_err(text),
                fine.wait().map_err(text),
            )
        });

        worker.run();
        let (missing, raised, fine) = poster.join().unwrap();

        assert!(!missing.unwrap());
        assert_eq!(raised.unwrap_err(), "task failed: raised on the host");
        assert_eq!(fine.unwrap(), catalog::get_user_id());
        assert!(!elog::has_pending_error());
    }

    #[test]
    fn test_dropped_worker_stops_tasks() {
        let (worker, handle) = Worker::new();
        drop(worker);

        // Host errors are not Send, so the outcome crosses back as text.
        let outcome = thread::spawn(move || handle.post(|| 1).wait().map_err(|err| err.to_string()))
            .join()
            .unwrap();
        assert_eq!(outcome.unwrap_err(), Error::WorkerStopped.to_string());
    }
}
