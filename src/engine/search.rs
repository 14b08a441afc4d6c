//! Off-thread nearest-neighbor search.
//!
//! Queries are potentially expensive relative to tick budgets, so they run
//! on a dedicated worker owning a shared read-only index. Communication is
//! message passing only: the engine submits immutable query payloads and
//! polls for the latest reply. A request superseded before the worker gets
//! to it is simply skipped; queries are idempotent and stateless.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread::JoinHandle;

use tracing::debug;

use crate::corpus::CorpusIndex;

/// Immutable query payload: one normalized live target.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub descriptor: Vec<f32>,
    pub loudness: f32,
    /// Candidate pool width (the "randomizer"), coerced to at least 1.
    pub k: usize,
}

/// Worker reply: matching frame indices plus the loudness that rode along
/// with the query (consumed together when a grain fires).
#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub frames: Vec<usize>,
    pub loudness: f32,
}

pub struct SearchWorker {
    request_tx: Option<Sender<SearchRequest>>,
    result_rx: Receiver<SearchMatch>,
    join: Option<JoinHandle<()>>,
}

impl SearchWorker {
    /// Spawn a worker over a built index. The index is shared by reference;
    /// it is never mutated after construction.
    pub fn spawn(index: Arc<CorpusIndex>) -> Self {
        let (request_tx, request_rx) = channel::<SearchRequest>();
        let (result_tx, result_rx) = channel::<SearchMatch>();
        let join = std::thread::spawn(move || worker_loop(index, request_rx, result_tx));
        Self {
            request_tx: Some(request_tx),
            result_rx,
            join: Some(join),
        }
    }

    /// Submit a query without blocking. A dead worker is treated as "no
    /// result will arrive": the engine degrades to silence, not a crash.
    pub fn submit(&self, request: SearchRequest) {
        if let Some(tx) = &self.request_tx
            && tx.send(request).is_err()
        {
            debug!("Search worker gone; dropping query");
        }
    }

    /// Latest reply that has arrived since the last poll, if any. Earlier
    /// unread replies are discarded; only the newest target matters.
    pub fn latest_match(&self) -> Option<SearchMatch> {
        let mut latest = None;
        loop {
            match self.result_rx.try_recv() {
                Ok(result) => latest = Some(result),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        latest
    }
}

impl Drop for SearchWorker {
    fn drop(&mut self) {
        // Disconnect the request channel so the worker loop ends.
        self.request_tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn worker_loop(
    index: Arc<CorpusIndex>,
    request_rx: Receiver<SearchRequest>,
    result_tx: Sender<SearchMatch>,
) {
    while let Ok(mut request) = request_rx.recv() {
        // Drain to the newest pending request; stale targets are obsolete
        // by the time we would answer them.
        while let Ok(newer) = request_rx.try_recv() {
            request = newer;
        }
        let frames: Vec<usize> = index
            .query(&request.descriptor, request.k.max(1))
            .into_iter()
            .map(|neighbor| neighbor.frame)
            .collect();
        let reply = SearchMatch {
            frames,
            loudness: request.loudness,
        };
        if result_tx.send(reply).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for_match(worker: &SearchWorker) -> SearchMatch {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(result) = worker.latest_match() {
                return result;
            }
            assert!(Instant::now() < deadline, "no search reply within 5s");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn test_index() -> Arc<CorpusIndex> {
        let descriptors: Vec<Vec<f32>> = (0..20).map(|i| vec![i as f32, 0.0]).collect();
        Arc::new(CorpusIndex::build(&descriptors).unwrap())
    }

    #[test]
    fn replies_carry_matching_frames_and_loudness() {
        let worker = SearchWorker::spawn(test_index());
        worker.submit(SearchRequest {
            descriptor: vec![7.1, 0.0],
            loudness: 0.6,
            k: 3,
        });
        let result = wait_for_match(&worker);
        assert_eq!(result.frames[0], 7);
        assert_eq!(result.frames.len(), 3);
        assert_eq!(result.loudness, 0.6);
    }

    #[test]
    fn zero_k_is_coerced_to_one() {
        let worker = SearchWorker::spawn(test_index());
        worker.submit(SearchRequest {
            descriptor: vec![3.0, 0.0],
            loudness: 0.1,
            k: 0,
        });
        let result = wait_for_match(&worker);
        assert_eq!(result.frames, vec![3]);
    }

    #[test]
    fn latest_poll_keeps_only_newest_reply() {
        let worker = SearchWorker::spawn(test_index());
        for i in 0..5 {
            worker.submit(SearchRequest {
                descriptor: vec![i as f32, 0.0],
                loudness: i as f32 * 0.1,
                k: 1,
            });
        }
        // Wait until the worker has drained everything it will answer.
        let mut last = wait_for_match(&worker);
        let settle = Instant::now() + Duration::from_millis(200);
        while Instant::now() < settle {
            if let Some(newer) = worker.latest_match() {
                last = newer;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        // Whatever arrived last corresponds to the newest answered request.
        assert_eq!(last.frames.len(), 1);
        assert!((last.loudness - 0.4).abs() < 1e-6);
    }

    #[test]
    fn dropping_worker_joins_thread() {
        let worker = SearchWorker::spawn(test_index());
        worker.submit(SearchRequest {
            descriptor: vec![0.0, 0.0],
            loudness: 0.0,
            k: 1,
        });
        drop(worker);
    }
}
