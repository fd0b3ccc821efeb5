//! End-to-end consensus scenarios with in-process peers.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use paxos::{
    Accepted, Client, ConsensusError, LocalPeer, Peer, PeerError, Peers, Proposal, Quorum, Server,
    Value, WireVersion,
};
use tokio::sync::{Semaphore, watch};

type TestServer = Server<i32, u64, u32, u32>;
type TestClient = Client<i32, u64, u32, u32>;
type TestPeers = Peers<i32, u64, u32, u32>;
type DynPeer = Box<dyn Peer<i32, u64, u32, u32>>;
type TestError = ConsensusError<u64, u32, u32>;

/// Initialize tracing for tests. Uses RUST_LOG for filtering.
fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("paxos=debug")),
        )
        .with_test_writer()
        .finish();
    tracing::dispatcher::set_default(&Dispatch::new(subscriber))
}

fn quorum(ids: impl IntoIterator<Item = u32>) -> Quorum<u32> {
    ids.into_iter().collect()
}

fn server(id: u32, members: impl IntoIterator<Item = u32>) -> Arc<Mutex<TestServer>> {
    Arc::new(Mutex::new(
        Server::new(id, quorum(members), WireVersion::CURRENT).expect("id is a member"),
    ))
}

fn local(server: &Arc<Mutex<TestServer>>) -> DynPeer {
    Box::new(LocalPeer::new(server.clone()))
}

/// A peer that fails every call with `Unavailable`.
struct UnavailablePeer {
    id: u32,
}

fn unavailable(id: u32) -> DynPeer {
    Box::new(UnavailablePeer { id })
}

#[async_trait]
impl Peer<i32, u64, u32, u32> for UnavailablePeer {
    fn id(&self) -> u32 {
        self.id
    }

    async fn propose(
        &self,
        _q: Quorum<u32>,
        _p: Proposal<u64, u32>,
    ) -> Result<Option<Accepted<i32, u64, u32, u32>>, PeerError<u64, u32, u32>> {
        Err(PeerError::Unavailable("injected outage".into()))
    }

    async fn accept(
        &self,
        _q: Quorum<u32>,
        _p: Proposal<u64, u32>,
        _value: Value<i32, u32>,
    ) -> Result<Proposal<u64, u32>, PeerError<u64, u32, u32>> {
        Err(PeerError::Unavailable("injected outage".into()))
    }

    async fn confirm(
        &self,
        _q: Quorum<u32>,
        _p: Proposal<u64, u32>,
    ) -> Result<(), PeerError<u64, u32, u32>> {
        Err(PeerError::Unavailable("injected outage".into()))
    }

    async fn get(
        &self,
        _q: Quorum<u32>,
    ) -> Result<Option<Accepted<i32, u64, u32, u32>>, PeerError<u64, u32, u32>> {
        Err(PeerError::Unavailable("injected outage".into()))
    }
}

/// A barrier that also signals how many callers have reached it.
struct Gate {
    open: watch::Sender<bool>,
    arrivals: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: watch::channel(false).0,
            arrivals: Semaphore::new(0),
        }
    }

    fn open(&self) {
        self.open.send_replace(true);
    }

    /// Signal arrival, then wait until the gate is open.
    async fn pass(&self) {
        self.arrivals.add_permits(1);
        let mut rx = self.open.subscribe();
        rx.wait_for(|open| *open)
            .await
            .expect("gate outlives its peer");
    }

    /// Wait until `n` callers have arrived at the gate.
    async fn arrived(&self, n: u32) {
        self.arrivals
            .acquire_many(n)
            .await
            .expect("semaphore never closed")
            .forget();
    }
}

struct Gates {
    propose: Gate,
    accept: Gate,
}

/// A local peer whose propose and accept calls block on test-controlled
/// gates, for scripting interleavings.
struct GatedPeer {
    inner: LocalPeer<i32, u64, u32, u32>,
    gates: Arc<Gates>,
}

fn gated(server: &Arc<Mutex<TestServer>>) -> (DynPeer, Arc<Gates>) {
    let gates = Arc::new(Gates {
        propose: Gate::new(),
        accept: Gate::new(),
    });
    let peer = GatedPeer {
        inner: LocalPeer::new(server.clone()),
        gates: gates.clone(),
    };
    (Box::new(peer), gates)
}

#[async_trait]
impl Peer<i32, u64, u32, u32> for GatedPeer {
    fn id(&self) -> u32 {
        self.inner.id()
    }

    async fn propose(
        &self,
        q: Quorum<u32>,
        p: Proposal<u64, u32>,
    ) -> Result<Option<Accepted<i32, u64, u32, u32>>, PeerError<u64, u32, u32>> {
        self.gates.propose.pass().await;
        self.inner.propose(q, p).await
    }

    async fn accept(
        &self,
        q: Quorum<u32>,
        p: Proposal<u64, u32>,
        value: Value<i32, u32>,
    ) -> Result<Proposal<u64, u32>, PeerError<u64, u32, u32>> {
        self.gates.accept.pass().await;
        self.inner.accept(q, p, value).await
    }

    async fn confirm(
        &self,
        q: Quorum<u32>,
        p: Proposal<u64, u32>,
    ) -> Result<(), PeerError<u64, u32, u32>> {
        self.inner.confirm(q, p).await
    }

    async fn get(
        &self,
        q: Quorum<u32>,
    ) -> Result<Option<Accepted<i32, u64, u32, u32>>, PeerError<u64, u32, u32>> {
        self.inner.get(q).await
    }
}

/// A peer whose accepts always fail, leaving replicas with proposals but no
/// accepted values.
struct ProposeOnlyPeer {
    inner: LocalPeer<i32, u64, u32, u32>,
}

fn propose_only(server: &Arc<Mutex<TestServer>>) -> DynPeer {
    Box::new(ProposeOnlyPeer {
        inner: LocalPeer::new(server.clone()),
    })
}

#[async_trait]
impl Peer<i32, u64, u32, u32> for ProposeOnlyPeer {
    fn id(&self) -> u32 {
        self.inner.id()
    }

    async fn propose(
        &self,
        q: Quorum<u32>,
        p: Proposal<u64, u32>,
    ) -> Result<Option<Accepted<i32, u64, u32, u32>>, PeerError<u64, u32, u32>> {
        self.inner.propose(q, p).await
    }

    async fn accept(
        &self,
        _q: Quorum<u32>,
        _p: Proposal<u64, u32>,
        _value: Value<i32, u32>,
    ) -> Result<Proposal<u64, u32>, PeerError<u64, u32, u32>> {
        Err(PeerError::Unavailable("accepts disabled".into()))
    }

    async fn confirm(
        &self,
        q: Quorum<u32>,
        p: Proposal<u64, u32>,
    ) -> Result<(), PeerError<u64, u32, u32>> {
        self.inner.confirm(q, p).await
    }

    async fn get(
        &self,
        q: Quorum<u32>,
    ) -> Result<Option<Accepted<i32, u64, u32, u32>>, PeerError<u64, u32, u32>> {
        self.inner.get(q).await
    }
}

fn coordinator(id: u32, peers: TestPeers) -> TestClient {
    let mut client = Client::with_seed(id, peers, u64::from(id));
    client.set_conflict_backoff(false);
    client
}

#[tokio::test]
async fn all_peers_available() {
    let _guard = init_tracing();
    let s1 = server(11, [11, 12, 13]);
    let s2 = server(12, [11, 12, 13]);
    let s3 = server(13, [11, 12, 13]);
    let mut client = coordinator(1, vec![local(&s1), local(&s2), local(&s3)]);
    assert_eq!(client.choose(42).await, Ok(None));
    assert_eq!(client.get().await, Ok(Some(42)));
}

#[tokio::test]
async fn one_failed_peer_is_tolerated() {
    let _guard = init_tracing();
    let s1 = server(11, [11, 12, 13]);
    let s2 = server(12, [11, 12, 13]);
    let mut client = coordinator(1, vec![local(&s1), local(&s2), unavailable(13)]);
    assert_eq!(client.choose(42).await, Ok(None));
    assert_eq!(client.get().await, Ok(Some(42)));
}

#[tokio::test]
async fn a_minority_cannot_decide() {
    let _guard = init_tracing();
    let s1 = server(11, [11, 12, 13]);
    let mut client = coordinator(1, vec![local(&s1), unavailable(12), unavailable(13)]);
    assert_eq!(
        client.choose(42).await,
        Err(TestError::TooFewPeers {
            effective: 1,
            total: 3
        })
    );
    assert!(matches!(
        client.get().await,
        Err(TestError::TooFewPeers { .. })
    ));
}

#[tokio::test]
async fn a_second_coordinator_learns_the_chosen_value() {
    let _guard = init_tracing();
    let s1 = server(11, [11, 12, 13]);
    let s2 = server(12, [11, 12, 13]);
    let s3 = server(13, [11, 12, 13]);
    let mut client_1 = coordinator(1, vec![local(&s1), local(&s2), local(&s3)]);
    let mut client_2 = coordinator(2, vec![local(&s1), local(&s2), local(&s3)]);
    assert_eq!(client_1.choose(42).await, Ok(None));
    let chosen = client_2
        .choose(43)
        .await
        .expect("choose")
        .expect("already chosen");
    assert_eq!(chosen.value, Value::Data(42));
}

#[tokio::test]
async fn concurrent_coordinators_converge() {
    let _guard = init_tracing();
    let s1 = server(11, [11, 12, 13]);
    let s2 = server(12, [11, 12, 13]);
    let s3 = server(13, [11, 12, 13]);
    let (peer_2, gates_2) = gated(&s2);
    let (peer_3, gates_3) = gated(&s3);
    gates_2.propose.open();
    gates_2.accept.open();
    gates_3.propose.open();
    let mut client_1 = coordinator(1, vec![local(&s1), peer_2, peer_3]);
    let mut client_2 = coordinator(2, vec![local(&s1), local(&s2), local(&s3)]);

    let first = tokio::spawn(async move { client_1.choose(42).await });
    // wait until client 1 is wedged mid-accept on replica 13
    gates_2.accept.arrived(1).await;
    gates_3.accept.arrived(1).await;

    let chosen = client_2
        .choose(43)
        .await
        .expect("choose")
        .expect("already chosen");
    assert_eq!(chosen.value, Value::Data(42));

    gates_3.accept.open();
    let first = first
        .await
        .expect("join")
        .expect("choose")
        .expect("already chosen");
    assert_eq!(first.value, Value::Data(42));
}

#[tokio::test]
async fn conflicting_coordinators_sort_it_out() {
    let _guard = init_tracing();
    let s1 = server(11, [11, 12, 13]);
    let s2 = server(12, [11, 12, 13]);
    let s3 = server(13, [11, 12, 13]);
    let (peer_2, gates_2) = gated(&s2);
    let (peer_3, gates_3) = gated(&s3);
    gates_2.propose.open();
    gates_3.propose.open();
    let mut client_1 = coordinator(1, vec![local(&s1), peer_2, peer_3]);
    let mut client_2 = coordinator(2, vec![unavailable(11), local(&s2), local(&s3)]);

    let first = tokio::spawn(async move { client_1.choose(43).await });
    gates_2.accept.arrived(1).await;
    gates_3.accept.arrived(1).await;

    // client 2 writes 42 while client 1 is blocked mid-accept
    assert_eq!(client_2.choose(42).await, Ok(None));

    gates_2.accept.open();
    gates_3.accept.open();
    let first = first
        .await
        .expect("join")
        .expect("choose")
        .expect("already chosen");
    assert_eq!(first.value, Value::Data(42));
}

#[tokio::test]
async fn a_newer_version_overrides_an_older_one() {
    let _guard = init_tracing();
    let s1 = server(11, [11, 12, 13]);
    let s2 = server(12, [11, 12, 13]);
    let s3 = server(13, [11, 12, 13]);
    let mut client_1 = coordinator(1, vec![local(&s1), local(&s2), local(&s3)]);
    let mut client_2 = coordinator(1, vec![local(&s1), local(&s2), local(&s3)]);
    assert_eq!(client_1.choose_at(1, 1).await, Ok(None));
    assert_eq!(client_2.choose_at(2, 2).await, Ok(None));
}

#[tokio::test]
async fn a_partially_agreed_newer_version_wins() {
    let _guard = init_tracing();
    let s1 = server(11, [11, 12, 13]);
    let s2 = server(12, [11, 12, 13]);
    let s3 = server(13, [11, 12, 13]);
    let (peer_1, gates_1) = gated(&s1);
    let (peer_2, gates_2) = gated(&s2);
    let (peer_3, gates_3) = gated(&s3);
    gates_1.propose.open();
    gates_1.accept.open();
    gates_2.propose.open();
    gates_3.propose.open();
    let mut client_1 = coordinator(1, vec![peer_1, peer_2, peer_3]);

    let mut client_2 = coordinator(2, vec![local(&s1), local(&s2), local(&s3)]);
    assert_eq!(client_2.choose_at(1, 1).await, Ok(None));

    // client 1 gets version 2 accepted on replica 11 only
    let first = tokio::spawn(async move { client_1.choose_at(2, 2).await });
    gates_1.accept.arrived(1).await;

    // a third coordinator targeting version 1 discovers the version 2 value
    let mut client_3 = coordinator(3, vec![local(&s1), local(&s2), local(&s3)]);
    let chosen = client_3
        .choose_at(1, 1)
        .await
        .expect("choose")
        .expect("newer value discovered");
    assert_eq!(chosen.value, Value::Data(2));

    gates_2.accept.open();
    gates_3.accept.open();
    let first = first
        .await
        .expect("join")
        .expect("choose")
        .expect("already chosen");
    assert_eq!(first.value, Value::Data(2));
}

#[tokio::test]
async fn an_aborted_newer_version_does_not_block_older_ones() {
    let _guard = init_tracing();
    let s1 = server(11, [11, 12, 13]);
    let s2 = server(12, [11, 12, 13]);
    let s3 = server(13, [11, 12, 13]);
    let mut client_1 = coordinator(1, vec![local(&s1), unavailable(12), unavailable(13)]);
    let mut client_2 = coordinator(2, vec![unavailable(11), local(&s2), local(&s3)]);
    assert!(matches!(
        client_1.choose_at(2, 2).await,
        Err(TestError::TooFewPeers { .. })
    ));
    assert_eq!(client_2.choose_at(1, 1).await, Ok(None));
}

#[tokio::test]
async fn quorum_extension() {
    let _guard = init_tracing();
    let s1 = server(11, [11]);
    let s2 = server(12, [11, 12]);
    let mut client = coordinator(1, vec![local(&s1)]);

    assert_eq!(client.choose_at(0, 0).await, Ok(None));
    // version 0 is settled: later writes at version 0 report the choice
    let chosen = client.choose_at(0, 1).await.expect("choose");
    assert_eq!(chosen.expect("already chosen").value, Value::Data(0));
    let chosen = client
        .choose_at(0, Value::Quorum(quorum([11, 12])))
        .await
        .expect("choose");
    assert_eq!(chosen.expect("already chosen").value, Value::Data(0));

    // growing the quorum is a consensus value like any other
    assert_eq!(
        client.choose_at(1, Value::Quorum(quorum([11, 12]))).await,
        Ok(None)
    );
    let chosen = client.choose_at(1, 1).await.expect("choose");
    assert_eq!(
        chosen.expect("already chosen").value,
        Value::Quorum(quorum([11, 12]))
    );

    // once version 1 advances, the old single-member quorum is refused
    assert_eq!(
        client.choose_at(2, 2).await,
        Err(TestError::WrongQuorum {
            expected: quorum([11, 12]),
            effective: quorum([11]),
        })
    );

    client.peers_mut().push(local(&s2));
    assert_eq!(client.choose_at(2, 2).await, Ok(None));
    assert_eq!(client.get().await, Ok(Some(2)));
    assert_eq!(client.choose_at(3, 3).await, Ok(None));

    // a straggler still writing against the single-member quorum is refused
    let mut straggler = coordinator(1, vec![local(&s1)]);
    assert!(matches!(
        straggler.choose_at(4, 4).await,
        Err(TestError::WrongQuorum { .. })
    ));
}

#[tokio::test]
async fn quorum_shrink() {
    let _guard = init_tracing();
    let s1 = server(11, [11, 12]);
    let s2 = server(12, [11, 12]);
    let mut client = coordinator(1, vec![local(&s1), local(&s2)]);

    assert_eq!(client.choose_at(0, 0).await, Ok(None));
    assert_eq!(
        client.choose_at(1, Value::Quorum(quorum([11]))).await,
        Ok(None)
    );
    // the dropped replica is now superfluous: the write is refused
    assert!(matches!(
        client.choose_at(2, 2).await,
        Err(TestError::WrongQuorum { .. })
    ));
    client.peers_mut().pop();
    assert_eq!(client.choose_at(2, 2).await, Ok(None));
}

#[tokio::test]
async fn an_evicted_replica_lags_behind() {
    let _guard = init_tracing();
    let s1 = server(11, [11, 12, 13]);
    let s2 = server(12, [11, 12, 13]);
    let s3 = server(13, [11, 12, 13]);
    let full = || vec![local(&s1), local(&s2), local(&s3)];
    let two = || vec![local(&s1), local(&s2)];
    let partial = || vec![local(&s1), local(&s2), unavailable(13)];

    assert_eq!(coordinator(1, full()).choose_at(1, 1).await, Ok(None));
    assert_eq!(coordinator(1, full()).choose_at(2, 2).await, Ok(None));
    // replica 13 misses the quorum change for version 3
    assert_eq!(
        coordinator(1, partial())
            .choose_at(3, Value::Quorum(quorum([11, 12])))
            .await,
        Ok(None)
    );

    // a write against the settled version reports the quorum change
    let chosen = coordinator(1, two())
        .choose_at(2, 21)
        .await
        .expect("choose")
        .expect("already chosen");
    assert!(chosen.confirmed);
    assert_eq!(chosen.value, Value::Quorum(quorum([11, 12])));

    let chosen = coordinator(1, partial())
        .choose_at(2, 21)
        .await
        .expect("choose")
        .expect("already chosen");
    assert_eq!(chosen.value, Value::Quorum(quorum([11, 12])));
    assert_eq!(chosen.proposal.version, 3);

    // the shrunk membership carries version 4
    assert_eq!(coordinator(1, two()).choose_at(4, 4).await, Ok(None));
}

#[tokio::test]
async fn a_lone_replica_thinking_the_quorum_changed_is_outvoted() {
    let _guard = init_tracing();
    let s1 = server(11, [11, 12, 13]);
    let s2 = server(12, [11, 12, 13]);
    let s3 = server(13, [11, 12, 13]);

    let mut all = coordinator(1, vec![local(&s1), local(&s2), local(&s3)]);
    assert_eq!(all.choose_at(1, 1).await, Ok(None));

    // a quorum change reaches replica 11 only
    let mut first_only = coordinator(2, vec![local(&s1), propose_only(&s2), propose_only(&s3)]);
    assert!(matches!(
        first_only
            .choose_at(2, Value::Quorum(quorum([11, 12])))
            .await,
        Err(TestError::TooFewPeers { .. })
    ));

    // the majority settles version 2 on a plain data value instead
    let mut majority = coordinator(3, vec![unavailable(11), local(&s2), local(&s3)]);
    assert_eq!(majority.choose_at(2, 2).await, Ok(None));

    // replica 11 abandons its stale quorum change and rejoins
    assert_eq!(all.choose_at(3, 3).await, Ok(None));
}

#[tokio::test]
async fn partial_state_is_recovered_by_the_majority() {
    let _guard = init_tracing();
    let servers = [
        server(11, [11, 12, 13]),
        server(12, [11, 12, 13]),
        server(13, [11, 12, 13]),
    ];
    let make_client = |availability: [bool; 3]| {
        let peers: TestPeers = servers
            .iter()
            .zip(availability)
            .enumerate()
            .map(|(i, (server, up))| {
                if up {
                    local(server)
                } else {
                    unavailable(11 + u32::try_from(i).expect("small index"))
                }
            })
            .collect();
        coordinator(1, peers)
    };

    assert_eq!(
        make_client([true, true, true]).choose_at(0, 0).await,
        Ok(None)
    );
    assert_eq!(
        make_client([true, true, false]).choose_at(1, 1).await,
        Ok(None)
    );
    // replica 11 is left holding a bare version 2 proposal
    assert!(matches!(
        make_client([true, false, false]).choose_at(2, 2).await,
        Err(TestError::TooFewPeers {
            effective: 1,
            total: 3
        })
    ));
    // the unconfirmed version 1 held by 13 is superseded by the majority
    assert_eq!(
        make_client([true, false, true]).choose_at(1, 2).await,
        Ok(None)
    );
}

#[tokio::test]
async fn snapshots_rebuild_byte_identical_replicas() {
    let _guard = init_tracing();
    let (bytes_1, bytes_2) = {
        let s1 = server(11, [11, 12]);
        let s2 = server(12, [11, 12]);
        let mut client = coordinator(1, vec![local(&s1), local(&s2)]);
        assert_eq!(client.choose_at(0, 0).await, Ok(None));
        assert_eq!(client.choose_at(1, 1).await, Ok(None));
        let bytes_1 = s1
            .lock()
            .unwrap()
            .serialize(WireVersion::CURRENT)
            .expect("encode");
        let bytes_2 = s2
            .lock()
            .unwrap()
            .serialize(WireVersion::CURRENT)
            .expect("encode");
        (bytes_1, bytes_2)
    };

    let s1: Arc<Mutex<TestServer>> = Arc::new(Mutex::new(
        Server::deserialize(&bytes_1, WireVersion::CURRENT).expect("decode"),
    ));
    let s2: Arc<Mutex<TestServer>> = Arc::new(Mutex::new(
        Server::deserialize(&bytes_2, WireVersion::CURRENT).expect("decode"),
    ));
    let mut client = coordinator(1, vec![local(&s1), local(&s2)]);
    let chosen = client
        .choose_at(1, 0)
        .await
        .expect("choose")
        .expect("already chosen");
    assert_eq!(chosen.value, Value::Data(1));
    assert_eq!(client.choose_at(2, 2).await, Ok(None));
}

#[tokio::test]
async fn replica_versions_never_regress() {
    let _guard = init_tracing();
    let s1 = server(11, [11, 12, 13]);
    let s2 = server(12, [11, 12, 13]);
    let s3 = server(13, [11, 12, 13]);
    let mut client = coordinator(1, vec![local(&s1), local(&s2), local(&s3)]);

    let mut watermark = 0;
    for version in 0..4u64 {
        assert_eq!(
            client.choose_at(version, i32::try_from(version).expect("small")).await,
            Ok(None)
        );
        let current = s1.lock().unwrap().current_version();
        assert!(current >= watermark);
        watermark = current;
    }
    assert_eq!(watermark, 3);
}
