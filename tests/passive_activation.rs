use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use fleetshell::core::{GatewayError, PassiveAgent, PassiveStatus, Result};
use fleetshell::passive::{ActiveLink, Dialer, PassiveRegistry, PassiveUpdate};

enum Outcome {
    Accept(oneshot::Receiver<()>),
    Refuse,
}

/// A dial the test has to answer
struct PendingDial {
    agent: PassiveAgent,
    reply: oneshot::Sender<Outcome>,
}

impl PendingDial {
    /// Let the dial succeed. Dropping the returned sender hangs up.
    fn accept(self) -> oneshot::Sender<()> {
        let (hangup_tx, hangup_rx) = oneshot::channel();
        let _ = self.reply.send(Outcome::Accept(hangup_rx));
        hangup_tx
    }

    fn refuse(self) {
        let _ = self.reply.send(Outcome::Refuse);
    }

    fn abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

struct ScriptedDialer {
    attempts: AtomicUsize,
    dials: mpsc::UnboundedSender<PendingDial>,
}

struct ScriptedLink {
    hangup: oneshot::Receiver<()>,
}

#[async_trait]
impl ActiveLink for ScriptedLink {
    async fn closed(&mut self) {
        let _ = (&mut self.hangup).await;
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self, agent: &PassiveAgent) -> Result<Box<dyn ActiveLink>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (reply, outcome) = oneshot::channel();
        let _ = self.dials.send(PendingDial {
            agent: agent.clone(),
            reply,
        });
        match outcome.await {
            Ok(Outcome::Accept(hangup)) => Ok(Box::new(ScriptedLink { hangup })),
            Ok(Outcome::Refuse) => Err(GatewayError::connection_failed("connection refused")),
            Err(_) => Err(GatewayError::connection_failed("test dropped the dial")),
        }
    }
}

struct Harness {
    registry: PassiveRegistry,
    dialer: Arc<ScriptedDialer>,
    dials: mpsc::UnboundedReceiver<PendingDial>,
}

impl Harness {
    fn new(dial_timeout: Duration) -> Self {
        let (dials_tx, dials) = mpsc::unbounded_channel();
        let dialer = Arc::new(ScriptedDialer {
            attempts: AtomicUsize::new(0),
            dials: dials_tx,
        });
        Harness {
            registry: PassiveRegistry::new(dialer.clone(), dial_timeout),
            dialer,
            dials,
        }
    }

    fn attempts(&self) -> usize {
        self.dialer.attempts.load(Ordering::SeqCst)
    }

    async fn next_dial(&mut self) -> PendingDial {
        self.dials.recv().await.expect("dialer dropped")
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn test_activate_now_twice_dials_once() {
    let mut h = Harness::new(Duration::from_secs(30));
    let record = h.registry.create("edge-1", "10.1.0.1:4040", 0).unwrap();
    assert!(h.registry.can_activate(&record.id));

    h.registry.activate_now(&record.id).unwrap();
    let second = h.registry.activate_now(&record.id).unwrap_err();
    assert!(matches!(second, GatewayError::ActivationInFlight { .. }));
    assert!(!h.registry.can_activate(&record.id));
    assert!(h.registry.is_in_flight(&record.id));

    let dial = h.next_dial().await;
    assert_eq!(dial.agent.id, record.id);
    let _hangup = dial.accept();

    let registry = h.registry.clone();
    wait_for(|| registry.get(&record.id).unwrap().status == PassiveStatus::Active).await;
    assert!(!h.registry.is_in_flight(&record.id));
    assert!(matches!(
        h.registry.activate_now(&record.id),
        Err(GatewayError::AlreadyActive { .. })
    ));
    assert_eq!(h.attempts(), 1);
    assert!(h.dials.try_recv().is_err());
}

#[tokio::test]
async fn test_refused_dial_frees_the_slot() {
    let mut h = Harness::new(Duration::from_secs(30));
    let record = h.registry.create("edge-2", "10.1.0.2:4040", 0).unwrap();

    h.registry.activate_now(&record.id).unwrap();
    h.next_dial().await.refuse();

    let registry = h.registry.clone();
    wait_for(|| registry.can_activate(&record.id)).await;
    assert_eq!(h.registry.get(&record.id).unwrap().status, PassiveStatus::Inactive);

    h.registry.activate_now(&record.id).unwrap();
    h.next_dial().await;
    assert_eq!(h.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_dials_on_schedule_until_active() {
    let mut h = Harness::new(Duration::from_secs(60));
    let record = h.registry.create("edge-3", "10.1.0.3:4040", 5).unwrap();

    // first attempt right away
    let start = Instant::now();
    h.next_dial().await.refuse();
    assert!(start.elapsed() < Duration::from_secs(1));

    let refused_at = Instant::now();
    let dial = h.next_dial().await;
    assert!(refused_at.elapsed() >= Duration::from_secs(5));
    let _hangup = dial.accept();

    let registry = h.registry.clone();
    wait_for(|| registry.get(&record.id).unwrap().status == PassiveStatus::Active).await;

    // ticks that find the record active are skipped
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_lost_link_resumes_automatic_retry() {
    let mut h = Harness::new(Duration::from_secs(60));
    let record = h.registry.create("edge-4", "10.1.0.4:4040", 5).unwrap();

    let hangup = h.next_dial().await.accept();
    let registry = h.registry.clone();
    wait_for(|| registry.get(&record.id).unwrap().status == PassiveStatus::Active).await;

    drop(hangup);
    wait_for(|| registry.get(&record.id).unwrap().status == PassiveStatus::Inactive).await;

    let dropped_at = Instant::now();
    h.next_dial().await;
    assert!(dropped_at.elapsed() <= Duration::from_secs(5));
    assert_eq!(h.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_retry_time_never_dials_by_itself() {
    let h = Harness::new(Duration::from_secs(10));
    h.registry.create("manual", "10.1.0.5:4040", 0).unwrap();
    assert_eq!(h.registry.start_all(), 0);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hung_dial_times_out() {
    let mut h = Harness::new(Duration::from_secs(10));
    let record = h.registry.create("slow", "10.1.0.6:4040", 0).unwrap();

    h.registry.activate_now(&record.id).unwrap();
    let dial = h.next_dial().await;

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(h.registry.is_in_flight(&record.id));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let registry = h.registry.clone();
    wait_for(|| registry.can_activate(&record.id)).await;
    assert!(dial.abandoned());
    assert_eq!(h.registry.get(&record.id).unwrap().status, PassiveStatus::Inactive);
}

#[tokio::test]
async fn test_delete_discards_an_in_flight_dial() {
    let mut h = Harness::new(Duration::from_secs(30));
    let record = h.registry.create("doomed", "10.1.0.7:4040", 0).unwrap();
    h.registry.activate_now(&record.id).unwrap();
    let dial = h.next_dial().await;

    let deleted = h.registry.delete(&record.id).unwrap();
    assert_eq!(deleted.name, "doomed");
    wait_for(|| dial.abandoned()).await;

    // answering late changes nothing
    let hangup = dial.accept();
    assert!(hangup.is_closed());
    assert!(h.registry.get(&record.id).is_none());
    assert!(h.registry.list().is_empty());
}

#[tokio::test]
async fn test_delete_hangs_up_an_active_link() {
    let mut h = Harness::new(Duration::from_secs(30));
    let record = h.registry.create("live", "10.1.0.8:4040", 0).unwrap();
    h.registry.activate_now(&record.id).unwrap();
    let hangup = h.next_dial().await.accept();

    let registry = h.registry.clone();
    wait_for(|| registry.get(&record.id).is_some_and(|r| r.status == PassiveStatus::Active)).await;

    h.registry.delete(&record.id).unwrap();
    wait_for(|| hangup.is_closed()).await;
}

#[tokio::test(start_paused = true)]
async fn test_delete_stops_the_retry_schedule() {
    let mut h = Harness::new(Duration::from_secs(60));
    let record = h.registry.create("retired", "10.1.0.9:4040", 5).unwrap();
    h.next_dial().await.refuse();

    let registry = h.registry.clone();
    wait_for(|| registry.can_activate(&record.id)).await;
    h.registry.delete(&record.id).unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_update_retry_time_reschedules() {
    let mut h = Harness::new(Duration::from_secs(60));
    let record = h.registry.create("later", "10.1.0.10:4040", 0).unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.attempts(), 0);

    let updated = h
        .registry
        .update(
            &record.id,
            PassiveUpdate {
                retry_time: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.retry_time, 3);
    assert!(updated.updated_at >= record.updated_at);

    let dial = h.next_dial().await;
    assert_eq!(dial.agent.id, record.id);
    dial.refuse();
    h.next_dial().await;
    assert_eq!(h.attempts(), 2);
}

#[tokio::test]
async fn test_list_is_newest_first() {
    let h = Harness::new(Duration::from_secs(30));
    let first = h.registry.create("first", "10.2.0.1:1", 0).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.registry.create("second", "10.2.0.2:1", 0).unwrap();

    let names: Vec<String> = h.registry.list().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec![second.name, first.name]);
}
