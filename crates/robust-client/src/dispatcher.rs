use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use robust_core::command::{AuthData, AuthReply, BacklogBatch, Command, MessageRecord, OutboundCommand};
use robust_core::events::{ClientEvent, EventBus};
use robust_core::ports::{AuthPrompt, Authenticator, CredentialStore};
use robust_store::MessageRepo;

use crate::connection::{ConnectionHooks, FrameSender};
use crate::session::Session;

/// Routes inbound frames to typed handlers and fans results out on the
/// event bus. Persistence-bearing commands (message, backlog) only publish
/// their event after the records are durable.
pub struct Dispatcher {
    store: Arc<MessageRepo>,
    bus: Arc<EventBus>,
    session: Mutex<Session>,
    credentials: Arc<dyn CredentialStore>,
    prompt: Arc<dyn AuthPrompt>,
    outbound: FrameSender,
    default_mode: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<MessageRepo>,
        bus: Arc<EventBus>,
        credentials: Arc<dyn CredentialStore>,
        prompt: Arc<dyn AuthPrompt>,
        outbound: FrameSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            session: Mutex::new(Session::new()),
            credentials,
            prompt,
            outbound,
            default_mode: "interactive".into(),
        })
    }

    /// Connection hooks wired to this dispatcher. Lifecycle transitions
    /// become bus events; frames feed [`Dispatcher::on_frame`].
    pub fn hooks(self: &Arc<Self>) -> ConnectionHooks {
        let lifecycle = |event: fn() -> ClientEvent, bus: Arc<EventBus>| -> Box<dyn Fn() + Send + Sync> {
            Box::new(move || bus.publish(event()))
        };
        let this = Arc::clone(self);
        ConnectionHooks {
            on_connecting: Some(lifecycle(
                || ClientEvent::ConnectionOpening,
                Arc::clone(&self.bus),
            )),
            on_open: Some(lifecycle(|| ClientEvent::ConnectionOpen, Arc::clone(&self.bus))),
            on_closing: Some(lifecycle(
                || ClientEvent::ConnectionClosing,
                Arc::clone(&self.bus),
            )),
            on_close: Some(lifecycle(|| ClientEvent::ConnectionClose, Arc::clone(&self.bus))),
            on_frame: Some(Box::new(move |line| this.on_frame(line))),
            on_error: Some(Box::new(|err| warn!(error = %err, "transport error"))),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.lock().is_authenticated()
    }

    /// Queue an auth request. Uses stored credentials when present, else
    /// falls back to the interactive challenge flow. Idempotent: once the
    /// session is authenticated further calls are ignored.
    pub fn authenticate(&self) {
        if self.session.lock().is_authenticated() {
            warn!("already authenticated, ignoring auth request");
            return;
        }
        let command = match self.credentials.authenticator() {
            Some(Authenticator { mode, key, secret }) => OutboundCommand::Auth {
                mode,
                challenge: Some(AuthData { key, secret }),
            },
            None => OutboundCommand::Auth {
                mode: self.default_mode.clone(),
                challenge: None,
            },
        };
        self.send_command(&command);
    }

    /// Entry point for every inbound frame. Empty frames count only as
    /// liveness and produce nothing. Malformed frames are dropped with a
    /// warning. Every successfully parsed frame produces exactly one
    /// raw-command event alongside its typed handling.
    pub fn on_frame(&self, frame: String) {
        if frame.trim().is_empty() {
            trace!("liveness frame");
            return;
        }
        let (command, raw) = match Command::decode(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };
        debug!(command = command.command_type(), "inbound command");

        match command {
            Command::Auth(reply) => self.handle_auth(reply),
            Command::Message(message) => self.handle_message(message),
            Command::Backlog(batch) => self.handle_backlog(batch),
            Command::Join(update) => self.bus.publish(ClientEvent::Join {
                channel: update.target,
            }),
            Command::Part(update) => self.bus.publish(ClientEvent::Part {
                channel: update.target,
            }),
            Command::Ping => {}
            Command::Unknown(value) => {
                debug!(frame = %value, "unrecognized command type");
            }
        }
        self.bus.publish(ClientEvent::RawCommand { command: raw });
    }

    fn handle_auth(&self, reply: AuthReply) {
        if reply.success {
            if let (Some(mode), Some(data)) = (reply.mode.clone(), reply.data.clone()) {
                self.credentials.set_authenticator(Authenticator {
                    mode,
                    key: data.key,
                    secret: data.secret,
                });
            }
            self.prompt.close();
            match &reply.user {
                Some(user) => {
                    for channel in &user.channels {
                        self.send_command(&OutboundCommand::Backlog {
                            target: channel.clone(),
                        });
                    }
                    self.session.lock().set_user(user.clone());
                }
                None => warn!("auth success without a user payload"),
            }
        } else if let Some(url) = reply.challenge.as_ref().and_then(|c| c.url.as_deref()) {
            self.prompt.open(url);
        }
        self.bus.publish(ClientEvent::Auth { reply });
    }

    fn handle_message(&self, message: MessageRecord) {
        if !message.target.is_group() {
            debug!(target = %message.target, "skipping non-group message");
            return;
        }
        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            match store.upsert(&message) {
                Ok(()) => bus.publish(ClientEvent::Message { message }),
                Err(e) => {
                    // Durability failed, so the event is suppressed too.
                    error!(error = %e, id = %message.id, "failed to cache message");
                }
            }
        });
    }

    fn handle_backlog(&self, batch: BacklogBatch) {
        if !batch.target.is_group() {
            debug!(target = %batch.target, "skipping non-group backlog");
            return;
        }
        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            match store.upsert_many(&batch.messages) {
                Ok(()) => bus.publish(ClientEvent::Backlog { batch }),
                Err(e) => {
                    error!(error = %e, target = %batch.target, "failed to cache backlog");
                }
            }
        });
    }

    fn send_command(&self, command: &OutboundCommand) {
        match command.encode() {
            Ok(frame) => {
                debug!(%frame, "outbound command");
                if let Err(e) = self.outbound.send(frame) {
                    warn!(error = %e, "failed to queue outbound frame");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode outbound command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use robust_core::ports::MemoryCredentialStore;
    use robust_store::Database;

    use crate::connection::frame_channel;

    struct RecordingPrompt {
        opened: Mutex<Vec<String>>,
        closed: std::sync::atomic::AtomicUsize,
    }

    impl RecordingPrompt {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                opened: Mutex::new(Vec::new()),
                closed: std::sync::atomic::AtomicUsize::new(0),
            })
        }
    }

    impl AuthPrompt for RecordingPrompt {
        fn open(&self, url: &str) {
            self.opened.lock().push(url.to_string());
        }

        fn close(&self) {
            self.closed
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        store: Arc<MessageRepo>,
        bus: Arc<EventBus>,
        prompt: Arc<RecordingPrompt>,
        credentials: Arc<MemoryCredentialStore>,
        outbound_rx: tokio::sync::mpsc::Receiver<String>,
    }

    fn build_fixture(db: Database, credentials: Arc<MemoryCredentialStore>) -> Fixture {
        let store = Arc::new(MessageRepo::new(db));
        let bus = Arc::new(EventBus::default());
        let prompt = RecordingPrompt::new();
        let (tx, rx) = frame_channel();
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&credentials) as Arc<dyn CredentialStore>,
            Arc::clone(&prompt) as Arc<dyn AuthPrompt>,
            tx,
        );
        Fixture {
            dispatcher,
            store,
            bus,
            prompt,
            credentials,
            outbound_rx: rx.into_inner(),
        }
    }

    fn fixture_with(credentials: Arc<MemoryCredentialStore>) -> Fixture {
        build_fixture(Database::in_memory().unwrap(), credentials)
    }

    fn fixture_with_db(db: Database) -> Fixture {
        build_fixture(db, Arc::new(MemoryCredentialStore::default()))
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryCredentialStore::default()))
    }

    /// Make inserts of the given id fail, so persistence errors can be
    /// exercised from the dispatcher side.
    fn db_failing_on(id: &str) -> Database {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(&format!(
                "CREATE TRIGGER fail_on_id BEFORE INSERT ON messages
                 WHEN NEW.id = '{id}'
                 BEGIN SELECT RAISE(ABORT, 'injected'); END;"
            ))
            .map_err(|e| robust_store::StoreError::Database(e.to_string()))
        })
        .unwrap();
        db
    }

    async fn recv_event(
        rx: &mut tokio::sync::broadcast::Receiver<ClientEvent>,
    ) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus closed")
    }

    fn message_frame(id: &str, target: &str, ts: i64) -> String {
        format!(
            r#"{{"type":"message","id":"{id}","body":"hi","ts":{ts},"target":"{target}","from":{{"id":"u1","handle":"bren"}}}}"#
        )
    }

    #[tokio::test]
    async fn every_parsed_frame_yields_one_raw_event() {
        let f = fixture();
        let mut raw = f.bus.subscribe("raw-command");

        f.dispatcher.on_frame(r#"{"type":"ping"}"#.into());
        f.dispatcher
            .on_frame(r#"{"type":"topology","nodes":3}"#.into());
        f.dispatcher
            .on_frame(r##"{"type":"join","target":"#general"}"##.into());

        for _ in 0..3 {
            let event = recv_event(&mut raw).await;
            assert!(matches!(event, ClientEvent::RawCommand { .. }));
        }
        assert!(matches!(
            raw.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn empty_frames_are_liveness_only() {
        let f = fixture();
        let mut raw = f.bus.subscribe("raw-command");

        f.dispatcher.on_frame(String::new());
        f.dispatcher.on_frame("   ".into());

        assert!(matches!(
            raw.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let f = fixture();
        let mut raw = f.bus.subscribe("raw-command");

        f.dispatcher.on_frame("this is not json".into());
        f.dispatcher.on_frame(r#"{"type":"message"}"#.into());

        assert!(matches!(
            raw.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn group_message_is_persisted_then_published() {
        let f = fixture();
        let mut messages = f.bus.subscribe("message");

        f.dispatcher.on_frame(message_frame("m1", "#general", 100));

        let event = recv_event(&mut messages).await;
        match event {
            ClientEvent::Message { message } => assert_eq!(message.id, "m1"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(f.store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn direct_message_is_not_persisted() {
        let f = fixture();
        let mut raw = f.bus.subscribe("raw-command");
        let mut messages = f.bus.subscribe("message");

        f.dispatcher.on_frame(message_frame("m1", "bren", 100));

        // The raw event still fires for the parsed frame.
        recv_event(&mut raw).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            messages.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(f.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn backlog_batch_is_atomic_and_published() {
        let f = fixture();
        let mut backlogs = f.bus.subscribe("backlog");

        let frame = format!(
            r##"{{"type":"backlog","target":"#general","messages":[{},{}]}}"##,
            message_frame("m1", "#general", 1),
            message_frame("m2", "#general", 2),
        );
        f.dispatcher.on_frame(frame);

        let event = recv_event(&mut backlogs).await;
        match event {
            ClientEvent::Backlog { batch } => {
                assert_eq!(batch.target.as_str(), "#general");
                assert_eq!(batch.messages.len(), 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(f.store.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn non_group_backlog_is_ignored() {
        let f = fixture();
        let mut raw = f.bus.subscribe("raw-command");
        let mut backlogs = f.bus.subscribe("backlog");

        let frame = format!(
            r#"{{"type":"backlog","target":"bren","messages":[{}]}}"#,
            message_frame("m1", "bren", 1),
        );
        f.dispatcher.on_frame(frame);

        // Still a parsed frame, so the raw event fires.
        recv_event(&mut raw).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            backlogs.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(f.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn backlog_event_suppressed_when_store_fails() {
        let f = fixture_with_db(db_failing_on("m2"));
        let mut raw = f.bus.subscribe("raw-command");
        let mut backlogs = f.bus.subscribe("backlog");

        let frame = format!(
            r##"{{"type":"backlog","target":"#general","messages":[{},{}]}}"##,
            message_frame("m1", "#general", 1),
            message_frame("m2", "#general", 2),
        );
        f.dispatcher.on_frame(frame);

        recv_event(&mut raw).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            backlogs.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
        // Rolled back, nothing from the batch survives.
        assert_eq!(f.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn message_event_suppressed_when_store_fails() {
        let f = fixture_with_db(db_failing_on("m1"));
        let mut raw = f.bus.subscribe("raw-command");
        let mut messages = f.bus.subscribe("message");

        f.dispatcher.on_frame(message_frame("m1", "#general", 100));

        recv_event(&mut raw).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            messages.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(f.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn join_and_part_publish_channel_events() {
        let f = fixture();
        let mut joins = f.bus.subscribe("join");
        let mut parts = f.bus.subscribe("part");

        f.dispatcher
            .on_frame(r##"{"type":"join","target":"#dev"}"##.into());
        f.dispatcher
            .on_frame(r##"{"type":"part","target":"#dev"}"##.into());

        assert!(matches!(
            recv_event(&mut joins).await,
            ClientEvent::Join { channel } if channel.as_str() == "#dev"
        ));
        assert!(matches!(
            recv_event(&mut parts).await,
            ClientEvent::Part { channel } if channel.as_str() == "#dev"
        ));
    }

    #[tokio::test]
    async fn authenticate_without_credentials_requests_interactive_mode() {
        let mut f = fixture();
        f.dispatcher.authenticate();

        let frame = f.outbound_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "auth");
        assert_eq!(value["mode"], "interactive");
        assert!(value.get("challenge").is_none());
    }

    #[tokio::test]
    async fn authenticate_with_credentials_sends_the_stored_triple() {
        let credentials = Arc::new(MemoryCredentialStore::with_authenticator(Authenticator {
            mode: "token".into(),
            key: "k1".into(),
            secret: "s1".into(),
        }));
        let mut f = fixture_with(credentials);
        f.dispatcher.authenticate();

        let frame = f.outbound_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "auth");
        assert_eq!(value["mode"], "token");
        assert_eq!(value["challenge"]["key"], "k1");
        assert_eq!(value["challenge"]["secret"], "s1");
    }

    #[tokio::test]
    async fn repeat_authenticate_sends_exactly_one_frame() {
        let mut f = fixture();
        let auth_success = r#"{"type":"auth","success":true,
            "user":{"id":"u1","handle":"bren","channels":[]}}"#;

        f.dispatcher.authenticate();
        f.dispatcher.on_frame(auth_success.into());
        f.dispatcher.authenticate();
        f.dispatcher.authenticate();

        let first = f.outbound_rx.recv().await.unwrap();
        assert!(first.contains(r#""type":"auth""#));
        assert!(f.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn auth_success_stores_credentials_and_requests_backlogs() {
        let mut f = fixture();
        let mut auths = f.bus.subscribe("auth");

        f.dispatcher.on_frame(
            r##"{"type":"auth","success":true,
                "mode":"token","data":{"key":"k9","secret":"s9"},
                "user":{"id":"u1","handle":"bren","channels":["#general","#dev"]}}"##
                .into(),
        );

        assert!(matches!(
            recv_event(&mut auths).await,
            ClientEvent::Auth { reply } if reply.success
        ));
        assert!(f.dispatcher.is_authenticated());

        let stored = f.credentials.authenticator().unwrap();
        assert_eq!(stored.mode, "token");
        assert_eq!(stored.key, "k9");

        // One backlog request per joined channel.
        let first = f.outbound_rx.recv().await.unwrap();
        let second = f.outbound_rx.recv().await.unwrap();
        assert!(first.contains(r#""type":"backlog""#));
        assert!(first.contains("#general"));
        assert!(second.contains("#dev"));
    }

    #[tokio::test]
    async fn auth_challenge_opens_the_prompt() {
        let f = fixture();

        f.dispatcher.on_frame(
            r#"{"type":"auth","success":false,
                "challenge":{"url":"https://auth.example/verify"}}"#
                .into(),
        );

        assert_eq!(
            f.prompt.opened.lock().as_slice(),
            ["https://auth.example/verify"]
        );
        assert!(!f.dispatcher.is_authenticated());
    }

    #[tokio::test]
    async fn auth_success_closes_the_prompt() {
        let f = fixture();

        f.dispatcher.on_frame(
            r#"{"type":"auth","success":false,
                "challenge":{"url":"https://auth.example/verify"}}"#
                .into(),
        );
        f.dispatcher.on_frame(
            r#"{"type":"auth","success":true,
                "user":{"id":"u1","handle":"bren","channels":[]}}"#
                .into(),
        );

        assert_eq!(
            f.prompt.closed.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert!(f.dispatcher.is_authenticated());
    }
}
