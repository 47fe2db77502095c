use log::{debug, error};
use tokio::task::JoinHandle;

/// Waits for every named loop and logs the ones that panicked or were
/// aborted. Returns how many ended that way.
pub async fn join_loops(loops: Vec<(&str, JoinHandle<()>)>) -> usize {
    let mut failed = 0;

    for (name, handle) in loops {
        match handle.await {
            Ok(()) => debug!("The {} loop stopped", name),
            Err(e) => {
                error!("The {} loop ended abnormally: {}", name, e);
                failed += 1;
            }
        }
    }

    failed
}
