use rand::Rng;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

use crate::config::BlockingQueryConfig;
use crate::error::{ControlError, Result};
use crate::raft::wait_for_leadership;
use crate::rpc::ServerState;
use crate::state::{StateSnapshot, WatchEvent, WatchSet};
use crate::structs::{QueryMeta, QueryOptions};

/// Run `query` against the current state and, when the caller asked for a
/// result newer than `min_query_index`, park until a table it read changes
/// or the wait runs out.
///
/// `query` returns its result together with the index that invalidates it.
/// Reaching the deadline is not an error: the query runs one last time and
/// its result is returned with an index no lower than `min_query_index`, so
/// long-polling clients simply reissue.
pub async fn blocking_rpc<T, F>(
    state: &ServerState,
    opts: &QueryOptions,
    mut query: F,
) -> Result<(T, QueryMeta)>
where
    F: FnMut(&mut WatchSet, &StateSnapshot) -> Result<(T, u64)>,
{
    let cfg = &state.config.blocking;
    let min_index = opts.min_query_index;
    let deadline = Instant::now() + query_wait(cfg, opts.max_query_time);

    let mut leadership = state.raft.leadership();
    let started_as_leader = *leadership.borrow_and_update();
    let mut rounds = 0;

    loop {
        let snapshot = state.fsm.state().snapshot();
        let mut ws = WatchSet::new();
        let (value, index) = query(&mut ws, &snapshot)?;
        let index = index.max(1);

        if min_index == 0 || index > min_index {
            return Ok((value, state.query_meta(index)));
        }
        if rounds >= cfg.max_rounds {
            return Ok((value, state.query_meta(index.max(min_index))));
        }
        rounds += 1;

        tokio::select! {
            event = ws.wait() => {
                if event == WatchEvent::Abandoned {
                    tracing::debug!(min_index, "State store replaced while blocked, re-running query");
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                let snapshot = state.fsm.state().snapshot();
                // A record's own index can trail the one the caller already
                // saw; never hand back less than that.
                let (value, index) = query(&mut WatchSet::new(), &snapshot)?;
                return Ok((value, state.query_meta(index.max(min_index).max(1))));
            }
            _ = state.shutdown.cancelled() => {
                return Err(ControlError::Unavailable("server is shutting down".to_string()));
            }
            _ = leadership_lost(&mut leadership), if started_as_leader => {
                return Err(ControlError::Unavailable("leadership lost".to_string()));
            }
        }
    }
}

async fn leadership_lost(rx: &mut watch::Receiver<bool>) {
    // A dropped sender means the consensus loop is gone, which is a loss too.
    wait_for_leadership(rx, false).await;
}

/// The requested wait clamped to the configured bounds, plus a random
/// stagger of up to `wait / jitter_fraction`.
pub(crate) fn query_wait(cfg: &BlockingQueryConfig, requested: Duration) -> Duration {
    let wait = clamped_wait(cfg, requested);
    let max_jitter = max_jitter(cfg, wait).as_nanos() as u64;
    if max_jitter == 0 {
        return wait;
    }
    wait + Duration::from_nanos(rand::thread_rng().gen_range(0..=max_jitter))
}

/// Longest time a blocking query with this requested wait can park,
/// jitter included.
pub fn max_query_wait(cfg: &BlockingQueryConfig, requested: Duration) -> Duration {
    let wait = clamped_wait(cfg, requested);
    wait + max_jitter(cfg, wait)
}

fn clamped_wait(cfg: &BlockingQueryConfig, requested: Duration) -> Duration {
    if requested.is_zero() {
        cfg.default_wait
    } else {
        requested.min(cfg.max_wait)
    }
}

fn max_jitter(cfg: &BlockingQueryConfig, wait: Duration) -> Duration {
    if cfg.jitter_fraction == 0 {
        Duration::ZERO
    } else {
        wait / cfg.jitter_fraction
    }
}
