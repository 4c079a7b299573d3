//! Candidate probing and host selection.
//!
//! Candidates are tried in the order the sender listed them. The first one
//! that answers a probe within `probe_timeout` is selected. The parallel
//! strategy probes every candidate at once but only settles on a candidate
//! once every earlier candidate has failed, so the choice is identical to the
//! sequential one.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::TcpStream;

use super::{Candidate, ConnectionInfo};
use crate::config::{NetworkConfig, ProbeStrategy};
use crate::error::{Error, Result};

/// A lightweight reachability check for one candidate.
pub trait Prober: Send + Sync {
    /// Resolve when `candidate` answered; fail when it refused.
    ///
    /// Timeouts are enforced by the resolver, so implementations may wait
    /// indefinitely.
    fn probe<'a>(&'a self, candidate: &'a Candidate) -> BoxFuture<'a, Result<()>>;
}

/// Probes by opening (and immediately dropping) a TCP connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

impl Prober for TcpProber {
    fn probe<'a>(&'a self, candidate: &'a Candidate) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let stream = TcpStream::connect((candidate.host.as_str(), candidate.port)).await?;
            drop(stream);
            Ok(())
        })
    }
}

/// Picks the sender host to connect to.
#[derive(Clone)]
pub struct CandidateResolver {
    prober: Arc<dyn Prober>,
    probe_timeout: Duration,
    strategy: ProbeStrategy,
}

impl std::fmt::Debug for CandidateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateResolver")
            .field("probe_timeout", &self.probe_timeout)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl CandidateResolver {
    /// Create a resolver with an explicit prober.
    pub fn new(prober: Arc<dyn Prober>, probe_timeout: Duration, strategy: ProbeStrategy) -> Self {
        Self {
            prober,
            probe_timeout,
            strategy,
        }
    }

    /// Create a TCP-probing resolver from network settings.
    #[must_use]
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(
            Arc::new(TcpProber),
            config.probe_timeout,
            config.probe_strategy,
        )
    }

    /// Select the first reachable candidate in listed order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoReachableHost`] when every candidate refused or
    /// timed out.
    pub async fn resolve(&self, info: &ConnectionInfo) -> Result<Candidate> {
        let candidates = info.candidates();
        tracing::debug!(
            "Probing {} candidate(s) ({:?}, {:?} each)",
            candidates.len(),
            self.strategy,
            self.probe_timeout
        );

        let selected = match self.strategy {
            ProbeStrategy::Sequential => self.resolve_sequential(candidates).await,
            ProbeStrategy::Parallel => self.resolve_parallel(candidates).await,
        };

        match selected {
            Some(candidate) => {
                tracing::info!("Selected sender host {candidate}");
                Ok(candidate.clone())
            }
            None => Err(Error::NoReachableHost {
                attempted: candidates.len(),
            }),
        }
    }

    /// Resolve and return the descriptor with its host selected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoReachableHost`] when no candidate answered.
    pub async fn resolve_info(&self, info: ConnectionInfo) -> Result<ConnectionInfo> {
        let host = self.resolve(&info).await?;
        info.with_selected(host)
    }

    async fn resolve_sequential<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        for candidate in candidates {
            if self.probe_one(candidate).await {
                return Some(candidate);
            }
        }
        None
    }

    async fn resolve_parallel<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        let mut results: Vec<Option<bool>> = vec![None; candidates.len()];
        let mut pending: FuturesUnordered<_> = candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| async move { (index, self.probe_one(candidate).await) })
            .collect();

        while let Some((index, reachable)) = pending.next().await {
            results[index] = Some(reachable);

            for (i, result) in results.iter().enumerate() {
                match result {
                    Some(true) => return Some(&candidates[i]),
                    Some(false) => {}
                    None => break,
                }
            }
        }
        None
    }

    async fn probe_one(&self, candidate: &Candidate) -> bool {
        match tokio::time::timeout(self.probe_timeout, self.prober.probe(candidate)).await {
            Ok(Ok(())) => {
                tracing::debug!("Candidate {candidate} reachable");
                true
            }
            Ok(Err(e)) => {
                tracing::debug!("Candidate {candidate} refused: {e}");
                false
            }
            Err(_) => {
                tracing::debug!(
                    "Candidate {candidate} timed out after {:?}",
                    self.probe_timeout
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Clone, Copy)]
    enum Behavior {
        Answer(Duration),
        Refuse,
        Hang,
    }

    /// Prober scripted per host, recording the order of probes.
    struct ScriptedProber {
        behavior: HashMap<String, Behavior>,
        probed: Mutex<Vec<String>>,
    }

    impl ScriptedProber {
        fn new(entries: &[(&str, Behavior)]) -> Arc<Self> {
            Arc::new(Self {
                behavior: entries
                    .iter()
                    .map(|(h, b)| ((*h).to_string(), *b))
                    .collect(),
                probed: Mutex::new(Vec::new()),
            })
        }
    }

    impl Prober for ScriptedProber {
        fn probe<'a>(&'a self, candidate: &'a Candidate) -> BoxFuture<'a, Result<()>> {
            self.probed.lock().unwrap().push(candidate.host.clone());
            let behavior = self.behavior[&candidate.host];
            Box::pin(async move {
                match behavior {
                    Behavior::Answer(delay) => {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    }
                    Behavior::Refuse => Err(Error::Io(std::io::Error::from(
                        std::io::ErrorKind::ConnectionRefused,
                    ))),
                    Behavior::Hang => futures::future::pending::<Result<()>>().await,
                }
            })
        }
    }

    fn info(hosts: &[&str]) -> ConnectionInfo {
        ConnectionInfo::new(hosts.iter().map(|h| Candidate::new(*h, 7017)).collect()).unwrap()
    }

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test(start_paused = true)]
    async fn test_first_reachable_wins_in_order() {
        let prober = ScriptedProber::new(&[
            ("h1", Behavior::Refuse),
            ("h2", Behavior::Answer(Duration::from_millis(10))),
            ("h3", Behavior::Answer(Duration::ZERO)),
        ]);
        let resolver = CandidateResolver::new(prober.clone(), TIMEOUT, ProbeStrategy::Sequential);

        let host = resolver.resolve(&info(&["h1", "h2", "h3"])).await.unwrap();
        assert_eq!(host.host, "h2");
        assert_eq!(*prober.probed.lock().unwrap(), vec!["h1", "h2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_candidate_preferred_when_all_reachable() {
        let prober = ScriptedProber::new(&[
            ("h1", Behavior::Answer(Duration::from_millis(500))),
            ("h2", Behavior::Answer(Duration::ZERO)),
        ]);

        for strategy in [ProbeStrategy::Sequential, ProbeStrategy::Parallel] {
            let resolver = CandidateResolver::new(prober.clone(), TIMEOUT, strategy);
            let host = resolver.resolve(&info(&["h1", "h2"])).await.unwrap();
            assert_eq!(host.host, "h1", "{strategy:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_candidate_is_skipped_after_timeout() {
        let prober = ScriptedProber::new(&[
            ("h1", Behavior::Hang),
            ("h2", Behavior::Answer(Duration::ZERO)),
        ]);
        let resolver = CandidateResolver::new(prober, TIMEOUT, ProbeStrategy::Sequential);

        let started = Instant::now();
        let host = resolver.resolve(&info(&["h1", "h2"])).await.unwrap();
        assert_eq!(host.host, "h2");
        assert!(started.elapsed() >= TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reachable_host_bounded_by_timeouts() {
        let prober = ScriptedProber::new(&[
            ("h1", Behavior::Hang),
            ("h2", Behavior::Refuse),
            ("h3", Behavior::Hang),
        ]);
        let resolver = CandidateResolver::new(prober, TIMEOUT, ProbeStrategy::Sequential);

        let started = Instant::now();
        let err = resolver
            .resolve(&info(&["h1", "h2", "h3"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoReachableHost { attempted: 3 }));
        assert!(started.elapsed() <= TIMEOUT * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_waits_only_one_timeout() {
        let prober = ScriptedProber::new(&[("h1", Behavior::Hang), ("h2", Behavior::Hang)]);
        let resolver = CandidateResolver::new(prober, TIMEOUT, ProbeStrategy::Parallel);

        let started = Instant::now();
        assert!(resolver.resolve(&info(&["h1", "h2"])).await.is_err());
        assert!(started.elapsed() < TIMEOUT * 2);
    }

    #[tokio::test]
    async fn test_tcp_prober_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();

        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let info = ConnectionInfo::new(vec![
            Candidate::new("127.0.0.1", closed_port),
            Candidate::new("127.0.0.1", open_port),
        ])
        .unwrap();
        let resolver =
            CandidateResolver::new(Arc::new(TcpProber), TIMEOUT, ProbeStrategy::Sequential);

        let resolved = resolver.resolve_info(info).await.unwrap();
        assert_eq!(resolved.selected_host().unwrap().port, open_port);
    }
}
