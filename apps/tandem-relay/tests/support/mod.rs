#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use serde_json::{json, Value};
use tandem_proto::{Envelope, IceCandidateInit, PeerRole, SessionDescription};
use tandem_relay::engine::{PeerSession, SessionContext, SessionEvent, SessionFactory};
use tandem_relay::error::{EngineError, Step};
use tandem_relay::router::{serve_connection, InboundFrame};
use tandem_relay::AppState;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

/// What the scripted engine does on each session it hands out.
#[derive(Clone, Debug, Default)]
pub struct Script {
    /// Engine call that fails, on the session with that role.
    pub fail_at: Option<(PeerRole, Step)>,
    /// Local candidates each session reports, all at once, after its local
    /// description is applied.
    pub candidates_per_session: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidateInit),
    Close,
}

pub struct FakeSession {
    role: PeerRole,
    ctx: SessionContext,
    script: Script,
    calls: Mutex<Vec<Call>>,
    closed: AtomicBool,
}

impl FakeSession {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidateInit> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::AddCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call, step: Option<Step>) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(call);
        match (self.script.fail_at, step) {
            (Some((role, failing)), Some(step)) if role == self.role && failing == step => Err(
                EngineError::Other(format!("scripted {} failure", step.as_str())),
            ),
            _ => Ok(()),
        }
    }

    fn emit_candidates(&self) {
        for index in 0..self.script.candidates_per_session {
            let events = self.ctx.events.clone();
            let role = self.role;
            tokio::spawn(async move {
                let _ = events.send(SessionEvent::LocalCandidate {
                    role,
                    candidate: IceCandidateInit {
                        candidate: format!(
                            "candidate:{index} 1 udp 2130706431 192.0.2.1 {} typ host",
                            50_000 + index
                        ),
                        sdp_mid: Some("0".into()),
                        sdp_mline_index: Some(0),
                        username_fragment: None,
                    },
                });
            });
        }
    }
}

#[async_trait]
impl PeerSession for FakeSession {
    fn role(&self) -> PeerRole {
        self.role
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.record(Call::CreateOffer, Some(Step::CreateOffer))?;
        Ok(SessionDescription::offer(fake_sdp(self.role)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record(Call::CreateAnswer, Some(Step::CreateAnswer))?;
        Ok(SessionDescription::answer(fake_sdp(self.role)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record(Call::SetLocal(desc), Some(Step::SetLocalDescription))?;
        self.emit_candidates();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record(Call::SetRemote(desc), Some(Step::SetRemoteDescription))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), EngineError> {
        self.record(Call::AddCandidate(candidate), Some(Step::AddIceCandidate))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        self.record(Call::Close, None)
    }
}

fn fake_sdp(role: PeerRole) -> String {
    format!("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=fake-{}\r\nt=0 0\r\n", role.as_str())
}

#[derive(Default)]
pub struct FakeFactory {
    script: Script,
    created: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.created.lock().unwrap().clone()
    }

    /// Most recent session created for `role`.
    pub fn latest(&self, role: PeerRole) -> Option<Arc<FakeSession>> {
        self.sessions()
            .into_iter()
            .rev()
            .find(|session| session.role == role)
    }

    fn make(&self, role: PeerRole, ctx: &SessionContext) -> Arc<dyn PeerSession> {
        let session = Arc::new(FakeSession {
            role,
            ctx: ctx.clone(),
            script: self.script.clone(),
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(session.clone());
        session
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn download_session(
        &self,
        ctx: &SessionContext,
    ) -> Result<Arc<dyn PeerSession>, EngineError> {
        Ok(self.make(PeerRole::Receiver, ctx))
    }

    async fn upload_session(
        &self,
        ctx: &SessionContext,
    ) -> Result<Arc<dyn PeerSession>, EngineError> {
        Ok(self.make(PeerRole::Sender, ctx))
    }
}

/// One client connection driven through in-memory channels.
pub struct Harness {
    pub state: AppState,
    pub factory: Arc<FakeFactory>,
    inbound: Option<fmpsc::UnboundedSender<Result<InboundFrame, Infallible>>>,
    outbound: fmpsc::UnboundedReceiver<String>,
    server: JoinHandle<()>,
}

impl Harness {
    pub fn start(script: Script) -> Self {
        let factory = Arc::new(FakeFactory::new(script));
        let state = AppState::new(factory.clone());
        let (in_tx, in_rx) = fmpsc::unbounded();
        let (out_tx, out_rx) = fmpsc::unbounded();
        let server = tokio::spawn(serve_connection(state.clone(), in_rx, out_tx));
        Self {
            state,
            factory,
            inbound: Some(in_tx),
            outbound: out_rx,
            server,
        }
    }

    pub fn send(&self, frame: InboundFrame) {
        if let Some(tx) = &self.inbound {
            tx.unbounded_send(Ok(frame)).expect("router still reading");
        }
    }

    pub fn send_json(&self, value: Value) {
        self.send(InboundFrame::Text(value.to_string()));
    }

    /// A browser-style offer: empty role, SDP double-encoded as a string.
    pub fn send_offer(&self) {
        let sdp = json!({ "type": "offer", "sdp": "v=0\r\ns=client\r\n" }).to_string();
        self.send_json(json!({ "peerType": "", "type": "offer", "data": sdp }));
    }

    pub fn send_answer(&self) {
        let sdp = json!({ "type": "answer", "sdp": "v=0\r\ns=client-answer\r\n" }).to_string();
        self.send_json(json!({ "peerType": "receiver", "type": "answer", "data": sdp }));
    }

    pub fn send_candidate(&self, peer_type: &str, candidate: &str) {
        self.send_json(json!({
            "peerType": peer_type,
            "type": "candidate",
            "data": { "candidate": candidate, "sdpMid": "0", "sdpMLineIndex": 0 }
        }));
    }

    pub async fn next_frame(&mut self) -> Option<String> {
        tokio::time::timeout(WAIT, self.outbound.next())
            .await
            .expect("timed out waiting for an outbound frame")
    }

    pub async fn next_envelope(&mut self) -> Envelope {
        let frame = self.next_frame().await.expect("connection closed");
        Envelope::from_text(&frame).expect("every frame is one complete envelope")
    }

    /// Closes the client side and waits for the read loop to finish.
    pub async fn disconnect(&mut self) {
        self.inbound.take();
        tokio::time::timeout(WAIT, &mut self.server)
            .await
            .expect("read loop did not stop after disconnect")
            .expect("router task panicked");
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
