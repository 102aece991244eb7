//! Single-consumer result collector.
//!
//! Workers never touch the result collection. Each one holds a
//! [`ResultSink`] and sends finished outcomes down a channel; one collector
//! task owns the `Vec` and is the only writer. The collection becomes
//! readable when every sink has been dropped, so [`ResultAggregator::finish`]
//! cannot observe a half-filled result set.
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Owner side of the collector.
#[derive(Debug)]
pub struct ResultAggregator<R> {
    collector: JoinHandle<Vec<R>>,
}

/// Write side handed to workers. Cloning is cheap.
#[derive(Debug)]
pub struct ResultSink<R> {
    tx: mpsc::UnboundedSender<R>,
}

impl<R> Clone for ResultSink<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R: Send + 'static> ResultAggregator<R> {
    /// Starts the collector task and returns its first sink.
    pub fn spawn() -> (Self, ResultSink<R>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let collector = tokio::spawn(async move {
            let mut results = Vec::new();
            while let Some(result) = rx.recv().await {
                results.push(result);
            }
            debug!("Result collector closed with {} results", results.len());
            results
        });

        (Self { collector }, ResultSink { tx })
    }

    /// Waits for every sink to be dropped and returns the collected results.
    ///
    /// Call this after the workers holding sinks have been joined; until
    /// then it simply keeps waiting.
    pub async fn finish(self) -> Vec<R> {
        match self.collector.await {
            Ok(results) => results,
            Err(e) => {
                warn!("Result collector failed: {e}");
                Vec::new()
            }
        }
    }
}

impl<R> ResultSink<R> {
    /// Hands one outcome to the collector. Returns `false` once the
    /// collector is gone.
    pub fn push(&self, result: R) -> bool {
        self.tx.send(result).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::ResultAggregator;
    use std::collections::HashSet;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_lose_nothing() {
        let (aggregator, sink) = ResultAggregator::spawn();

        let writers: Vec<_> = (0..16u32)
            .map(|writer| {
                let sink = sink.clone();
                tokio::spawn(async move {
                    for i in 0..250 {
                        assert!(sink.push(writer * 1000 + i));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        drop(sink);

        for writer in writers {
            writer.await.unwrap();
        }

        let results = aggregator.finish().await;
        assert_eq!(results.len(), 16 * 250);
        assert_eq!(results.iter().collect::<HashSet<_>>().len(), 16 * 250);
    }

    #[tokio::test]
    async fn no_writers_yields_empty() {
        let (aggregator, sink) = ResultAggregator::<u8>::spawn();
        drop(sink);
        assert!(aggregator.finish().await.is_empty());
    }
}
