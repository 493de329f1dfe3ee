/*!
Helpers de test communs

- Initialisation unique des logs (env_logger, `RUST_LOG`)
- Attente active bornée sur une condition
*/

use std::time::Duration;
use tokio::time::{sleep, Instant};

pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// Vérifie `cond` toutes les 10ms jusqu'à `within` ; retourne le dernier résultat
pub async fn wait_until<F>(within: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_until_sees_late_condition() {
        let counter = Arc::new(AtomicU32::new(0));
        let bump = Arc::clone(&counter);
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            bump.store(1, Ordering::SeqCst);
        });
        assert!(wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) == 1).await);
    }

    #[tokio::test]
    async fn wait_until_gives_up() {
        assert!(!wait_until(Duration::from_millis(30), || false).await);
    }
}
