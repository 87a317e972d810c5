//! Session negotiator: a bounded request/response facade over the
//! callback-driven peer connection engine.

pub mod candidate;
pub mod engine;
pub mod exchange;
pub mod rtc;

use std::io::Cursor;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use webrtc::sdp::SessionDescription;

use self::engine::{IceCandidate, PeerFactory, PeerSession};
use self::exchange::{Action, Exchange, ExchangeState, StepEvent};
use crate::error::NegotiationError;
use crate::telemetry::Telemetry;

/// Remote candidates seen before the remote description was applied are
/// held here and replayed afterwards.
enum CandidateQueue {
    Pending(Vec<IceCandidate>),
    Ready,
}

/// The one peer connection this process negotiates.
struct Connection {
    session: OnceLock<Arc<dyn PeerSession>>,
    candidates: Mutex<CandidateQueue>,
}

impl Connection {
    fn new() -> Self {
        Self {
            session: OnceLock::new(),
            candidates: Mutex::new(CandidateQueue::Pending(vec![])),
        }
    }

    fn is_closed(&self) -> bool {
        self.session.get().is_some_and(|s| s.is_closed())
    }

    /// Queues the candidate unless the remote description is already set,
    /// in which case the session to hand it to is returned.
    fn queue_or_session(&self, candidate: IceCandidate) -> Option<(Arc<dyn PeerSession>, IceCandidate)> {
        let mut queue = self.candidates.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *queue {
            CandidateQueue::Pending(pending) => {
                pending.push(candidate);
                None
            }
            CandidateQueue::Ready => self.session.get().map(|s| (s.clone(), candidate)),
        }
    }

    fn mark_ready(&self) -> Vec<IceCandidate> {
        let mut queue = self.candidates.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *queue, CandidateQueue::Ready) {
            CandidateQueue::Pending(pending) => pending,
            CandidateQueue::Ready => vec![],
        }
    }
}

type Slot = Arc<Mutex<Option<Arc<Connection>>>>;

fn lock(slot: &Slot) -> std::sync::MutexGuard<'_, Option<Arc<Connection>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Empties the slot only if it still holds `conn`.
fn clear_slot(slot: &Slot, conn: &Arc<Connection>) -> bool {
    let mut guard = lock(slot);
    if guard.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
        *guard = None;
        true
    } else {
        false
    }
}

pub struct Negotiator {
    factory: Arc<dyn PeerFactory>,
    timeout: Duration,
    slot: Slot,
    telemetry: Telemetry,
}

impl Negotiator {
    pub fn new(factory: Arc<dyn PeerFactory>, timeout: Duration, telemetry: Telemetry) -> Self {
        Self {
            factory,
            timeout,
            slot: Arc::new(Mutex::new(None)),
            telemetry,
        }
    }

    pub fn has_active_connection(&self) -> bool {
        lock(&self.slot).as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Runs one offer/answer exchange and returns the local answer.
    ///
    /// The engine steps run on their own task. If they outlive `timeout`
    /// the caller gets [`NegotiationError::Timeout`] and the connection
    /// stays reachable for candidates until the late steps finish.
    pub async fn handle_offer(&self, offer: &str) -> Result<String, NegotiationError> {
        validate_offer(offer)?;

        let conn = Arc::new(Connection::new());
        {
            let mut slot = lock(&self.slot);
            if slot.as_ref().is_some_and(|c| !c.is_closed()) {
                return Err(NegotiationError::AlreadyActive);
            }
            *slot = Some(conn.clone());
        }

        let (tx, rx) = oneshot::channel();
        let exchange = Exchange::new(offer.to_string(), tx);
        self.telemetry.spawn(drive(
            self.factory.clone(),
            self.slot.clone(),
            conn,
            exchange,
        ));

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NegotiationError::EngineGone),
            Err(_) => {
                warn!("negotiation did not finish within {:?}", self.timeout);
                Err(NegotiationError::Timeout)
            }
        }
    }

    /// `transport_id` is the media `mid`, `transport_index` its m-line index.
    /// An empty candidate marks the end of candidates and is accepted.
    pub async fn add_ice_candidate(
        &self,
        transport_id: &str,
        transport_index: u16,
        candidate: &str,
    ) -> Result<(), NegotiationError> {
        if candidate.trim().is_empty() {
            debug!("end of remote candidates");
            return Ok(());
        }
        let parsed = candidate::parse_candidate(
            candidate,
            Some(transport_id.to_string()),
            Some(transport_index),
        )?;
        self.add_parsed_candidate(parsed).await
    }

    /// Adds a candidate that was already parsed, e.g. from an sdpfrag body.
    pub async fn add_parsed_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let conn = lock(&self.slot)
            .clone()
            .ok_or(NegotiationError::NoActiveConnection)?;
        match conn.queue_or_session(candidate) {
            None => {
                debug!("remote candidate queued until the offer is applied");
                Ok(())
            }
            Some((session, candidate)) => add_to_session(&*session, candidate).await,
        }
    }

    /// Closes and forgets the active connection, if any.
    pub async fn close(&self) {
        let conn = lock(&self.slot).take();
        if let Some(session) = conn.as_ref().and_then(|c| c.session.get()) {
            info!("closing peer connection");
            session.close().await;
        }
    }
}

fn validate_offer(offer: &str) -> Result<(), NegotiationError> {
    let mut reader = Cursor::new(offer.as_bytes());
    let description = SessionDescription::unmarshal(&mut reader)
        .map_err(|e| NegotiationError::MalformedOffer(e.to_string()))?;
    if description.media_descriptions.is_empty() {
        return Err(NegotiationError::MalformedOffer(
            "offer has no media sections".to_string(),
        ));
    }
    Ok(())
}

async fn add_to_session(session: &dyn PeerSession, candidate: IceCandidate) -> Result<(), NegotiationError> {
    session.add_ice_candidate(candidate).await.map_err(|e| {
        warn!("remote candidate rejected: {}", e);
        NegotiationError::Rejected(e)
    })
}

/// Creates the connection and performs each action the exchange asks for.
async fn drive(factory: Arc<dyn PeerFactory>, slot: Slot, conn: Arc<Connection>, mut exchange: Exchange) {
    let session = match factory.create().await {
        Ok(session) => session,
        Err(e) => {
            exchange.abort("create connection", e);
            clear_slot(&slot, &conn);
            return;
        }
    };
    // set before checking the slot, so a concurrent close either sees the
    // session or leaves the slot empty for us to notice
    let set = conn.session.set(session.clone()).is_ok();
    let still_current = lock(&slot).as_ref().is_some_and(|c| Arc::ptr_eq(c, &conn));
    if !set || !still_current {
        exchange.abort("create connection", "connection closed during negotiation".to_string());
        session.close().await;
        return;
    }

    let mut next = exchange.start();
    while let Some(action) = next {
        let step = action.step();
        let event = match action {
            Action::SetRemoteDescription(offer) => session
                .set_remote_description(offer)
                .await
                .map(|_| StepEvent::RemoteDescriptionSet),
            Action::CreateAnswer => session.create_answer().await.map(StepEvent::AnswerCreated),
            Action::SetLocalDescription(answer) => session
                .set_local_description(answer)
                .await
                .map(|_| StepEvent::LocalDescriptionSet),
            Action::Serialize => session.local_description().await.map(StepEvent::Serialized),
        }
        .unwrap_or_else(|message| StepEvent::Failed { step, message });

        if event == StepEvent::RemoteDescriptionSet {
            for candidate in conn.mark_ready() {
                let _ = add_to_session(&*session, candidate).await;
            }
        }
        next = exchange.dispatch(event);
    }

    if exchange.state() == ExchangeState::Completed && exchange.delivered() {
        debug!("negotiation completed");
        return;
    }
    if exchange.state() == ExchangeState::Completed {
        warn!("answer produced after the caller gave up, dropping connection");
    }
    if clear_slot(&slot, &conn) {
        session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    pub(crate) const OFFER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\nc=IN IP4 0.0.0.0\r\na=mid:0\r\na=rtpmap:96 VP8/90000\r\n";
    const CANDIDATE: &str = "candidate:1 1 udp 2122260223 192.0.2.1 61764 typ host";

    #[derive(Default)]
    struct Script {
        fail_step: Option<&'static str>,
        delay: Duration,
    }

    #[derive(Default)]
    struct MockSession {
        script: Script,
        remote_set: Mutex<bool>,
        candidates: Mutex<Vec<IceCandidate>>,
        closed: Mutex<bool>,
    }

    impl MockSession {
        fn step(&self, name: &'static str) -> Result<(), String> {
            match self.script.fail_step {
                Some(step) if step == name => Err(format!("{} exploded", name)),
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl PeerSession for MockSession {
        async fn set_remote_description(&self, _offer: String) -> Result<(), String> {
            tokio::time::sleep(self.script.delay).await;
            self.step("set remote description")?;
            *self.remote_set.lock().unwrap() = true;
            Ok(())
        }

        async fn create_answer(&self) -> Result<String, String> {
            self.step("create answer").map(|_| "v=0 answer".to_string())
        }

        async fn set_local_description(&self, _answer: String) -> Result<(), String> {
            self.step("set local description")
        }

        async fn local_description(&self) -> Result<String, String> {
            self.step("serialize local description")
                .map(|_| "v=0 answer".to_string())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), String> {
            if !*self.remote_set.lock().unwrap() {
                return Err("no remote description".to_string());
            }
            let mut seen = self.candidates.lock().unwrap();
            if seen.contains(&candidate) {
                return Err("duplicate".to_string());
            }
            seen.push(candidate);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            *self.closed.lock().unwrap()
        }

        async fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    struct MockFactory {
        fail_step: Option<&'static str>,
        delay: Duration,
        created: Mutex<Vec<Arc<MockSession>>>,
    }

    impl MockFactory {
        fn new(fail_step: Option<&'static str>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                fail_step,
                delay,
                created: Mutex::new(vec![]),
            })
        }

        fn last(&self) -> Arc<MockSession> {
            self.created.lock().unwrap().last().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerFactory for MockFactory {
        async fn create(&self) -> Result<Arc<dyn PeerSession>, String> {
            let session = Arc::new(MockSession {
                script: Script {
                    fail_step: self.fail_step,
                    delay: self.delay,
                },
                ..Default::default()
            });
            self.created.lock().unwrap().push(session.clone());
            Ok(session)
        }
    }

    fn negotiator(factory: Arc<MockFactory>, timeout: Duration) -> Negotiator {
        Negotiator::new(factory, timeout, Telemetry::disabled())
    }

    #[tokio::test]
    async fn answers_a_valid_offer() {
        let factory = MockFactory::new(None, Duration::ZERO);
        let n = negotiator(factory.clone(), Duration::from_secs(5));
        assert_eq!(n.handle_offer(OFFER).await.unwrap(), "v=0 answer");
        assert!(n.has_active_connection());
        assert_eq!(
            n.handle_offer(OFFER).await,
            Err(NegotiationError::AlreadyActive)
        );
        assert_eq!(factory.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_offer_leaves_nothing_behind() {
        let factory = MockFactory::new(None, Duration::ZERO);
        let n = negotiator(factory.clone(), Duration::from_secs(5));
        assert!(matches!(
            n.handle_offer("hello").await,
            Err(NegotiationError::MalformedOffer(_))
        ));
        assert!(!n.has_active_connection());
        assert!(factory.created.lock().unwrap().is_empty());
        assert!(n.handle_offer(OFFER).await.is_ok());
    }

    #[tokio::test]
    async fn failing_step_is_reported_and_connection_dropped() {
        let factory = MockFactory::new(Some("create answer"), Duration::ZERO);
        let n = negotiator(factory.clone(), Duration::from_secs(5));
        match n.handle_offer(OFFER).await {
            Err(NegotiationError::StepFailed { step, message }) => {
                assert_eq!(step, "create answer");
                assert_eq!(message, "create answer exploded");
            }
            other => panic!("unexpected {:?}", other),
        }
        // the driver cleans up right after resolving
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!n.has_active_connection());
        assert!(factory.last().is_closed());
    }

    #[tokio::test]
    async fn timeout_tolerates_late_completion() {
        let factory = MockFactory::new(None, Duration::from_millis(200));
        let n = negotiator(factory.clone(), Duration::from_millis(20));
        assert_eq!(n.handle_offer(OFFER).await, Err(NegotiationError::Timeout));
        // still reachable while the engine finishes
        assert!(n.add_ice_candidate("0", 0, CANDIDATE).await.is_ok());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!n.has_active_connection());
        let session = factory.last();
        assert!(session.is_closed());
        assert_eq!(session.candidates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn candidates_need_a_connection() {
        let n = negotiator(MockFactory::new(None, Duration::ZERO), Duration::from_secs(5));
        assert_eq!(
            n.add_ice_candidate("0", 0, CANDIDATE).await,
            Err(NegotiationError::NoActiveConnection)
        );
    }

    #[tokio::test]
    async fn malformed_and_rejected_candidates_differ() {
        let n = negotiator(MockFactory::new(None, Duration::ZERO), Duration::from_secs(5));
        n.handle_offer(OFFER).await.unwrap();
        assert!(matches!(
            n.add_ice_candidate("0", 0, "candidate:nope").await,
            Err(NegotiationError::MalformedCandidate(_))
        ));
        assert!(n.add_ice_candidate("0", 0, CANDIDATE).await.is_ok());
        assert!(matches!(
            n.add_ice_candidate("0", 0, CANDIDATE).await,
            Err(NegotiationError::Rejected(_))
        ));
        // rejection does not tear the connection down
        assert!(n.has_active_connection());
        assert!(n.add_ice_candidate("0", 0, "").await.is_ok());
    }

    #[tokio::test]
    async fn close_allows_a_new_offer() {
        let factory = MockFactory::new(None, Duration::ZERO);
        let n = negotiator(factory.clone(), Duration::from_secs(5));
        n.handle_offer(OFFER).await.unwrap();
        n.close().await;
        assert!(factory.last().is_closed());
        assert!(n.handle_offer(OFFER).await.is_ok());
        assert_eq!(factory.created.lock().unwrap().len(), 2);
    }
}
