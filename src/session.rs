//! Per-connection protocol state machine.
//!
//! A session decodes inbound frames in receipt order and dispatches them
//! against the shared [`Relay`]. Each live subscription gets a delivery task
//! that drains its outbox into the connection's writer queue; the session
//! owns those tasks and aborts them on CLOSE, on replacement, and on
//! teardown.

use std::{collections::HashMap, sync::Arc};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    event::Event,
    filter::Filter,
    message::{ClientMessage, CodecError, RelayMessage},
    registry::{ConnectionId, Outbox},
    relay::{Relay, RelayError},
    service::{failure_event, ServiceError, ServiceHandler},
};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reading and writing permitted.
    Open,
    /// Teardown in progress; no further frames are processed.
    Closing,
    /// Terminal.
    Closed,
}

pub struct Session {
    id: ConnectionId,
    relay: Arc<Relay>,
    writer: mpsc::Sender<RelayMessage>,
    deliveries: HashMap<String, JoinHandle<()>>,
    state: SessionState,
}

impl Session {
    pub(crate) fn new(
        id: ConnectionId,
        relay: Arc<Relay>,
        writer: mpsc::Sender<RelayMessage>,
    ) -> Self {
        Self {
            id,
            relay,
            writer,
            deliveries: HashMap::new(),
            state: SessionState::Open,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Decode and dispatch one text frame. Decode failures only affect this
    /// frame; an error is returned only when the connection can no longer be
    /// written to.
    pub async fn handle_frame(&mut self, frame: &str) -> Result<(), RelayError> {
        if self.state != SessionState::Open {
            return Ok(());
        }
        match ClientMessage::decode(frame) {
            Ok(msg) => self.dispatch(msg).await,
            Err(CodecError::UnsupportedMessageType(tag)) => {
                debug!(conn = self.id, tag = %tag, "ignoring unsupported message");
                Ok(())
            }
            Err(e) => {
                warn!(conn = self.id, error = %e, "dropping message");
                self.send(RelayMessage::notice(e.to_string())).await
            }
        }
    }

    /// Dispatch an already decoded message.
    pub async fn dispatch(&mut self, msg: ClientMessage) -> Result<(), RelayError> {
        match msg {
            ClientMessage::Event(event) => self.on_event(event).await,
            ClientMessage::Req {
                subscription_id,
                filters,
            } => self.on_req(subscription_id, filters).await,
            ClientMessage::Close { subscription_id } => {
                self.on_close(&subscription_id);
                Ok(())
            }
        }
    }

    async fn on_event(&mut self, event: Event) -> Result<(), RelayError> {
        if self.relay.verify_sig() {
            if let Err(e) = event.verify() {
                debug!(conn = self.id, event = %event.id, error = %e, "rejecting event");
                return self
                    .send(RelayMessage::Ok {
                        event_id: event.id,
                        accepted: false,
                        message: format!("invalid: {e}"),
                    })
                    .await;
            }
        }

        if let Some(handler) = self.relay.services().get(event.kind) {
            let response = run_service(handler, Arc::new(event)).await;
            if !self.relay.respond(self.id, response)? {
                warn!(conn = self.id, "writer queue full, dropping service response");
            }
            return Ok(());
        }

        let event = Arc::new(event);
        let delivered = self.relay.registry().broadcast(&event);
        debug!(conn = self.id, event = %event.id, kind = event.kind, delivered, "broadcast");
        self.send(RelayMessage::Ok {
            event_id: event.id.clone(),
            accepted: true,
            message: String::new(),
        })
        .await
    }

    async fn on_req(&mut self, sub: String, filters: Vec<Filter>) -> Result<(), RelayError> {
        let outbox = self.relay.registry().add(self.id, &sub, filters);
        if let Some(previous) = self.deliveries.remove(&sub) {
            previous.abort();
        }
        debug!(conn = self.id, sub = %sub, "subscribed");
        // nothing is stored, so EOSE goes out before delivery starts; live
        // events wait in the outbox until then
        self.send(RelayMessage::Eose {
            subscription_id: sub.clone(),
        })
        .await?;
        let task = tokio::spawn(deliver(sub.clone(), outbox, self.writer.clone()));
        self.deliveries.insert(sub, task);
        Ok(())
    }

    fn on_close(&mut self, sub: &str) {
        self.relay.registry().remove(self.id, sub);
        if let Some(task) = self.deliveries.remove(sub) {
            task.abort();
        }
        debug!(conn = self.id, sub, "closed subscription");
    }

    async fn send(&self, msg: RelayMessage) -> Result<(), RelayError> {
        self.writer
            .send(msg)
            .await
            .map_err(|_| RelayError::WriterClosed(self.id))
    }

    /// Tear the session down: drop every subscription, stop delivery tasks and
    /// unregister from the relay. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state != SessionState::Open {
            return;
        }
        self.state = SessionState::Closing;
        let removed = self.relay.registry().remove_all(self.id);
        for (_, task) in self.deliveries.drain() {
            task.abort();
        }
        self.relay.disconnect(self.id);
        self.state = SessionState::Closed;
        info!(conn = self.id, subscriptions = removed, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Forward a subscription's events to the connection writer in order.
async fn deliver(sub: String, mut outbox: Outbox, writer: mpsc::Sender<RelayMessage>) {
    while let Some(event) = outbox.recv().await {
        let msg = RelayMessage::Event {
            subscription_id: Some(sub.clone()),
            event,
        };
        if writer.send(msg).await.is_err() {
            break;
        }
    }
}

/// Run a blocking handler off the async workers. Failures become a result
/// event describing the error.
async fn run_service(handler: Arc<dyn ServiceHandler>, request: Arc<Event>) -> Event {
    let req = Arc::clone(&request);
    match tokio::task::spawn_blocking(move || handler.handle(&req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(event = %request.id, kind = request.kind, error = %e, "service failed");
            failure_event(&request, &e)
        }
        Err(_) => failure_event(&request, &ServiceError::Panicked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::tests::{sample_event, signed_event},
        event::Tag,
        relay::RelayConfig,
        service::{Services, AGENT_COMMAND_KIND},
    };
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };
    use tokio::time::timeout;

    fn relay_with(config: RelayConfig) -> Arc<Relay> {
        Arc::new(Relay::new(config, Services::builtin(&[AGENT_COMMAND_KIND])))
    }

    fn relay() -> Arc<Relay> {
        relay_with(RelayConfig::default())
    }

    async fn next(rx: &mut mpsc::Receiver<RelayMessage>) -> RelayMessage {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("writer closed")
    }

    async fn assert_quiet(rx: &mut mpsc::Receiver<RelayMessage>) {
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    fn event_frame(ev: &Event) -> String {
        ClientMessage::Event(ev.clone()).encode()
    }

    fn delivered_id(msg: RelayMessage, sub: &str) -> String {
        match msg {
            RelayMessage::Event {
                subscription_id: Some(s),
                event,
            } if s == sub => event.id.clone(),
            other => panic!("expected EVENT for {sub}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn req_then_live_event() {
        let relay = relay();
        let (mut sub, mut sub_rx) = relay.connect();
        let (mut publisher, mut pub_rx) = relay.connect();

        sub.handle_frame(r#"["REQ","s",{"kinds":[1]}]"#).await.unwrap();
        assert_eq!(
            next(&mut sub_rx).await,
            RelayMessage::Eose {
                subscription_id: "s".into()
            }
        );

        publisher
            .handle_frame(&event_frame(&sample_event("aa", "p", 1, 1)))
            .await
            .unwrap();
        publisher
            .handle_frame(&event_frame(&sample_event("bb", "p", 2, 1)))
            .await
            .unwrap();
        assert!(matches!(
            next(&mut pub_rx).await,
            RelayMessage::Ok { accepted: true, .. }
        ));
        assert_eq!(delivered_id(next(&mut sub_rx).await, "s"), "aa");
        assert_quiet(&mut sub_rx).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn eose_precedes_live_events_under_concurrent_broadcast() {
        let relay = relay();
        let stop = Arc::new(AtomicBool::new(false));
        let publisher = {
            let relay = Arc::clone(&relay);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let ev = Arc::new(sample_event("live", "p", 1, 1));
                while !stop.load(Ordering::Relaxed) {
                    relay.registry().broadcast(&ev);
                }
            })
        };
        for _ in 0..500 {
            let (mut s, mut rx) = relay.connect();
            s.handle_frame(r#"["REQ","s",{}]"#).await.unwrap();
            match next(&mut rx).await {
                RelayMessage::Eose { subscription_id } => assert_eq!(subscription_id, "s"),
                other => panic!("expected EOSE first, got {other:?}"),
            }
        }
        stop.store(true, Ordering::Relaxed);
        publisher.join().unwrap();
    }

    #[tokio::test]
    async fn events_arrive_in_broadcast_order() {
        let relay = relay();
        let (mut sub, mut sub_rx) = relay.connect();
        let (mut publisher, _pub_rx) = relay.connect();
        sub.handle_frame(r#"["REQ","s",{}]"#).await.unwrap();
        next(&mut sub_rx).await;
        for i in 0..20 {
            publisher
                .handle_frame(&event_frame(&sample_event(&i.to_string(), "p", 1, i)))
                .await
                .unwrap();
        }
        for i in 0..20 {
            assert_eq!(delivered_id(next(&mut sub_rx).await, "s"), i.to_string());
        }
    }

    #[tokio::test]
    async fn replacing_subscription_changes_filters() {
        let relay = relay();
        let (mut sub, mut sub_rx) = relay.connect();
        let (mut publisher, _pub_rx) = relay.connect();
        sub.handle_frame(r#"["REQ","sub1",{"kinds":[1]}]"#).await.unwrap();
        sub.handle_frame(r#"["REQ","sub1",{"kinds":[2]}]"#).await.unwrap();
        next(&mut sub_rx).await;
        next(&mut sub_rx).await;
        assert_eq!(relay.registry().len(), 1);

        publisher
            .handle_frame(&event_frame(&sample_event("one", "p", 1, 1)))
            .await
            .unwrap();
        publisher
            .handle_frame(&event_frame(&sample_event("two", "p", 2, 1)))
            .await
            .unwrap();
        assert_eq!(delivered_id(next(&mut sub_rx).await, "sub1"), "two");
        assert_quiet(&mut sub_rx).await;
    }

    #[tokio::test]
    async fn close_stops_delivery_and_unknown_close_is_noop() {
        let relay = relay();
        let (mut sub, mut sub_rx) = relay.connect();
        let (mut publisher, _pub_rx) = relay.connect();
        sub.handle_frame(r#"["CLOSE","nope"]"#).await.unwrap();
        sub.handle_frame(r#"["REQ","s",{}]"#).await.unwrap();
        next(&mut sub_rx).await;
        sub.handle_frame(r#"["CLOSE","s"]"#).await.unwrap();
        sub.handle_frame(r#"["CLOSE","s"]"#).await.unwrap();
        assert!(relay.registry().is_empty());
        publisher
            .handle_frame(&event_frame(&sample_event("aa", "p", 1, 1)))
            .await
            .unwrap();
        assert_quiet(&mut sub_rx).await;
    }

    #[tokio::test]
    async fn malformed_frames_get_notice_and_session_survives() {
        let relay = relay();
        let (mut s, mut rx) = relay.connect();
        s.handle_frame("not json").await.unwrap();
        assert!(matches!(next(&mut rx).await, RelayMessage::Notice { .. }));
        s.handle_frame(r#"["EVENT",{"id":1}]"#).await.unwrap();
        match next(&mut rx).await {
            RelayMessage::Notice { message } => assert!(message.starts_with("malformed event")),
            other => panic!("unexpected {other:?}"),
        }
        s.handle_frame(r#"["REQ","s",{"kinds":"x"}]"#).await.unwrap();
        assert!(matches!(next(&mut rx).await, RelayMessage::Notice { .. }));
        s.handle_frame(r#"["AUTH","x"]"#).await.unwrap();
        s.handle_frame(r#"["REQ","s",{}]"#).await.unwrap();
        assert!(matches!(next(&mut rx).await, RelayMessage::Eose { .. }));
        assert_eq!(s.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn service_kind_answers_sender_only() {
        let relay = relay();
        let (mut watcher, mut watch_rx) = relay.connect();
        let (mut requester, mut req_rx) = relay.connect();
        watcher.handle_frame(r#"["REQ","all",{}]"#).await.unwrap();
        next(&mut watch_rx).await;

        let mut req = sample_event("req1", "p1", AGENT_COMMAND_KIND, 1);
        req.tags = vec![Tag(vec!["i".into(), "status".into(), "text".into()])];
        requester.handle_frame(&event_frame(&req)).await.unwrap();
        match next(&mut req_rx).await {
            RelayMessage::Event {
                subscription_id: None,
                event,
            } => {
                assert_eq!(event.kind, 6838);
                assert_eq!(event.tags[0].0, vec!["e", "req1"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_quiet(&mut watch_rx).await;
    }

    #[tokio::test]
    async fn service_failure_becomes_error_event() {
        let relay = relay();
        let (mut s, mut rx) = relay.connect();
        let req = sample_event("req1", "p1", AGENT_COMMAND_KIND, 1);
        s.handle_frame(&event_frame(&req)).await.unwrap();
        match next(&mut rx).await {
            RelayMessage::Event { event, .. } => {
                assert_eq!(event.kind, 6838);
                assert!(event.content.starts_with("error: invalid request"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    struct Panics;

    impl ServiceHandler for Panics {
        fn handle(&self, _request: &Event) -> Result<Event, ServiceError> {
            panic!("boom")
        }
    }

    #[tokio::test]
    async fn panicking_service_does_not_kill_session() {
        let mut services = Services::new();
        services.register(5100, Arc::new(Panics)).unwrap();
        let relay = Arc::new(Relay::new(RelayConfig::default(), services));
        let (mut s, mut rx) = relay.connect();
        s.handle_frame(&event_frame(&sample_event("r", "p", 5100, 1)))
            .await
            .unwrap();
        match next(&mut rx).await {
            RelayMessage::Event { event, .. } => assert_eq!(event.content, "error: handler panicked"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(s.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn verification_policy() {
        let relay = relay_with(RelayConfig {
            verify_sig: true,
            ..Default::default()
        });
        let (mut s, mut rx) = relay.connect();
        s.handle_frame(&event_frame(&signed_event(1, "ok"))).await.unwrap();
        assert!(matches!(
            next(&mut rx).await,
            RelayMessage::Ok { accepted: true, .. }
        ));
        let mut forged = signed_event(1, "ok");
        forged.content = "forged".into();
        s.handle_frame(&event_frame(&forged)).await.unwrap();
        match next(&mut rx).await {
            RelayMessage::Ok {
                accepted: false,
                message,
                ..
            } => assert_eq!(message, "invalid: id mismatch"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn teardown_removes_subscriptions_and_is_idempotent() {
        let relay = relay();
        let (mut s, mut rx) = relay.connect();
        s.handle_frame(r#"["REQ","a",{}]"#).await.unwrap();
        s.handle_frame(r#"["REQ","b",{}]"#).await.unwrap();
        next(&mut rx).await;
        next(&mut rx).await;
        assert_eq!(relay.registry().len(), 2);
        s.close();
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(relay.registry().is_empty());
        assert_eq!(relay.connection_count(), 0);
        // frames after teardown are ignored
        s.handle_frame(r#"["REQ","c",{}]"#).await.unwrap();
        assert!(relay.registry().is_empty());
    }

    #[tokio::test]
    async fn dropped_writer_is_reported() {
        let relay = relay();
        let (mut s, rx) = relay.connect();
        drop(rx);
        assert!(matches!(
            s.handle_frame(r#"["REQ","s",{}]"#).await,
            Err(RelayError::WriterClosed(_))
        ));
    }
}
