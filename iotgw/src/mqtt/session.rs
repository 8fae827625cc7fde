use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroU16;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use bytestring::ByteString;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use iotgw_codec::{Packet, Protocol, Publish, QoS};

use crate::codec::{Codec, MessageContext};
use crate::context::ServerContext;
use crate::device::{DeviceSession, HashMap};
use crate::mqtt::Client;
use crate::utils::{catch_panic, Done};
use crate::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub client_id: String,
    pub username: Option<String>,
    pub clean_session: bool,
    pub protocol: Protocol,
    pub product_id: String,
    pub device_id: Option<String>,
}

/// A QoS 1 message waiting for its PUBACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: ByteString,
    pub payload: Bytes,
    pub qos: QoS,
}

/// In-flight QoS 1 messages, resent oldest first.
#[derive(Debug, Default)]
pub(crate) struct Inflight {
    pending: HashMap<u16, (u64, Message)>,
    // send order, entries are dropped lazily once acknowledged
    queue: VecDeque<(u16, u64)>,
    next_id: u16,
    seq: u64,
}

impl Inflight {
    /// Next free packet id, skipping 0 and ids still in flight.
    pub(crate) fn next_packet_id(&mut self) -> Result<u16> {
        for _ in 0..=u16::MAX {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.pending.contains_key(&self.next_id) {
                return Ok(self.next_id);
            }
        }
        Err(GatewayError::InflightFull.into())
    }

    pub(crate) fn push(&mut self, id: u16, msg: Message) {
        self.seq += 1;
        self.pending.insert(id, (self.seq, msg));
        self.queue.push_back((id, self.seq));
    }

    #[inline]
    pub(crate) fn ack(&mut self, id: u16) -> Option<Message> {
        self.pending.remove(&id).map(|(_, msg)| msg)
    }

    /// The oldest message still pending.
    pub(crate) fn next_resend(&mut self) -> Option<(u16, &Message)> {
        while let Some(&(id, seq)) = self.queue.front() {
            if matches!(self.pending.get(&id), Some((s, _)) if *s == seq) {
                return self.pending.get(&id).map(|(_, msg)| (id, msg));
            }
            self.queue.pop_front();
        }
        None
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Default)]
struct SessionState {
    topics: HashMap<String, QoS>,
    inflight: Inflight,
    client: Option<Client>,
}

/// Delivery state of one device, outliving its connection when persistent.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: String,
    scx: ServerContext,
    codec: Arc<dyn Codec>,
    info: SessionInfo,
    state: Mutex<SessionState>,
    done: Done,
    on_closed: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Session {
    /// Creates the session and starts its resend supervisor.
    pub fn new(scx: ServerContext, codec: Arc<dyn Codec>, info: SessionInfo, resend_interval: Duration) -> Self {
        let inner = Arc::new(SessionInner {
            id: uuid::Uuid::new_v4().to_string(),
            scx,
            codec,
            info,
            state: Mutex::new(SessionState::default()),
            done: Done::new(),
            on_closed: Mutex::new(None),
        });
        tokio::spawn(resend_pending(Arc::downgrade(&inner), inner.done.clone(), resend_interval));
        Self { inner }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[inline]
    pub fn info(&self) -> &SessionInfo {
        &self.inner.info
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        !self.inner.info.clean_session
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.done.is_done()
    }

    #[inline]
    pub fn client(&self) -> Option<Client> {
        self.inner.state.lock().client.clone()
    }

    #[inline]
    pub fn inflight_len(&self) -> usize {
        self.inner.state.lock().inflight.len()
    }

    #[inline]
    pub fn topic_qos(&self, topic: &str) -> Option<QoS> {
        self.inner.state.lock().topics.get(topic).copied()
    }

    /// Runs `f` once the session ends, at once if it already has.
    pub(crate) fn on_closed<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut slot = self.inner.on_closed.lock();
            if !self.is_closed() {
                *slot = Some(Box::new(f));
                return;
            }
        }
        f()
    }

    pub(crate) fn attach(&self, client: Client) {
        self.inner.state.lock().client = Some(client);
    }

    /// Drops the client only if it is still the one with `uid`.
    pub(crate) fn detach_if(&self, uid: &str) -> bool {
        let mut state = self.inner.state.lock();
        if state.client.as_ref().map(|c| c.uid() == uid).unwrap_or(false) {
            state.client = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn subscribe<I: IntoIterator<Item = (String, QoS)>>(&self, topics: I) {
        let mut state = self.inner.state.lock();
        for (topic, qos) in topics {
            if qos == QoS::ExactlyOnce {
                log::warn!("{} subscribe {} with QoS 2, publishes on it will be refused", self.inner.info.client_id, topic);
            }
            state.topics.insert(topic, qos);
        }
    }

    pub(crate) fn unsubscribe<'a, I: IntoIterator<Item = &'a str>>(&self, topics: I) {
        let mut state = self.inner.state.lock();
        for topic in topics {
            state.topics.remove(topic);
        }
    }

    /// Sends `payload` to the device at the QoS it subscribed `topic` with, QoS 0 otherwise.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(GatewayError::SessionClosed.into());
        }
        let (client, packet) = {
            let mut state = self.inner.state.lock();
            let qos = state.topics.get(topic).copied().unwrap_or(QoS::AtMostOnce);
            let packet_id = match qos {
                QoS::AtMostOnce => None,
                QoS::AtLeastOnce => {
                    let id = state.inflight.next_packet_id()?;
                    state.inflight.push(id, Message { topic: topic.into(), payload: payload.clone(), qos });
                    NonZeroU16::new(id)
                }
                QoS::ExactlyOnce => {
                    log::error!("{} publish to {}, QoS 2 is not supported", self.inner.info.client_id, topic);
                    return Err(GatewayError::QoS2Unsupported.into());
                }
            };
            (state.client.clone(), Packet::Publish(Publish::new(topic.into(), payload, qos, packet_id)))
        };

        match client {
            Some(client) => {
                if let Err(e) = client.send(packet).await {
                    log::debug!("{} publish to {} not sent, {}", self.inner.info.client_id, topic, e);
                }
            }
            None if packet_id_of(&packet).is_some() => {
                log::debug!("{} offline, keep message to {} in flight", self.inner.info.client_id, topic);
            }
            None => {
                log::debug!("{} offline, drop message to {}", self.inner.info.client_id, topic);
            }
        }
        Ok(())
    }

    pub(crate) fn puback(&self, packet_id: u16) {
        if self.inner.state.lock().inflight.ack(packet_id).is_none() {
            log::debug!("{} PUBACK for unknown packet id {}", self.inner.info.client_id, packet_id);
        }
    }

    /// Hands an inbound message to the codec. Codec failures are logged only.
    pub(crate) async fn on_message(&self, topic: String, packet_id: Option<u16>, payload: Bytes) {
        let ctx = MessageContext {
            scx: self.inner.scx.clone(),
            product_id: self.inner.info.product_id.clone(),
            device_id: self.inner.info.device_id.clone(),
            topic,
            packet_id,
            payload,
            session: Arc::new(self.clone()),
        };
        if let Err(e) = catch_panic(self.inner.codec.on_message(&ctx)).await {
            log::warn!("{} on_message of {:?} failed, {}", self.inner.info.client_id, ctx.topic, e);
        }
    }

    fn resend_one(&self) {
        let (client, packet) = {
            let mut state = self.inner.state.lock();
            let client = match &state.client {
                Some(c) if !c.is_disconnected() => c.clone(),
                _ => return,
            };
            let (id, msg) = match state.inflight.next_resend() {
                Some(next) => next,
                None => return,
            };
            let mut publish = Publish::new(msg.topic.clone(), msg.payload.clone(), msg.qos, NonZeroU16::new(id));
            publish.dup = true;
            (client, Packet::Publish(publish))
        };
        if let Err(e) = client.try_send(packet) {
            log::debug!("{} resend failed, {}", self.inner.info.client_id, e);
        }
    }

    /// Ends the session: unregisters the device and closes the client. Idempotent.
    pub fn disconnect(&self) {
        if !self.inner.done.fire() {
            return;
        }
        if let Some(device_id) = &self.inner.info.device_id {
            self.inner.scx.sessions.remove_if_same(device_id, &self.inner.id);
        }
        let client = self.inner.state.lock().client.take();
        if let Some(client) = client {
            client.close();
        }
        let on_closed = self.inner.on_closed.lock().take();
        if let Some(f) = on_closed {
            f();
        }
        log::debug!("session {} of {} disconnected", self.inner.id, self.inner.info.client_id);
    }
}

#[inline]
fn packet_id_of(packet: &Packet) -> Option<NonZeroU16> {
    match packet {
        Packet::Publish(p) => p.packet_id,
        _ => None,
    }
}

/// Resends at most one pending message per tick until the session ends.
async fn resend_pending(session: Weak<SessionInner>, done: Done, interval: Duration) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = done.wait() => break,
            _ = ticker.tick() => match session.upgrade() {
                Some(inner) => Session { inner }.resend_one(),
                None => break,
            },
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Session {{ id: {}, {:?}, closed: {} }}", self.inner.id, self.inner.info, self.is_closed())
    }
}

#[async_trait]
impl DeviceSession for Session {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn device_id(&self) -> Option<String> {
        self.inner.info.device_id.clone()
    }

    async fn send(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.publish(topic, payload).await
    }

    fn disconnect(&self) {
        Session::disconnect(self)
    }

    fn close(&self) {
        if let Some(client) = self.client() {
            client.close();
        }
    }

    fn info(&self) -> serde_json::Value {
        json!({
            "username": self.inner.info.username,
            "clientID": self.inner.info.client_id,
            "cleanSession": self.inner.info.clean_session,
            "protocol": self.inner.info.protocol.level(),
        })
    }

    fn codec(&self) -> Arc<dyn Codec> {
        self.inner.codec.clone()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::codec::LogCodec;
    use crate::device::Device;
    use crate::mqtt::ClientInfo;

    fn session(clean_session: bool) -> Session {
        let scx = ServerContext::new().devices(vec![Device::new("d1", "p1")]).build();
        let info = SessionInfo {
            client_id: "c1".into(),
            username: None,
            clean_session,
            protocol: Protocol::default(),
            product_id: "p1".into(),
            device_id: Some("d1".into()),
        };
        Session::new(scx, Arc::new(LogCodec), info, Duration::from_millis(200))
    }

    fn client() -> (Client, mpsc::Receiver<Packet>) {
        let info = ClientInfo::new("c1".into(), None, None, 0, true, Protocol::default(), ([127, 0, 0, 1], 9).into(), None);
        Client::new(info, 16)
    }

    fn publish_of(packet: Packet) -> Publish {
        match packet {
            Packet::Publish(p) => p,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_packet_ids_skip_zero_and_inflight() {
        let mut inflight = Inflight::default();
        let msg = Message { topic: "t".into(), payload: Bytes::new(), qos: QoS::AtLeastOnce };
        inflight.next_id = u16::MAX - 1;
        let a = inflight.next_packet_id().unwrap();
        inflight.push(a, msg.clone());
        assert_eq!(a, u16::MAX);
        assert_eq!(inflight.next_packet_id().unwrap(), 1);

        inflight.next_id = u16::MAX - 1;
        assert_eq!(inflight.next_packet_id().unwrap(), 1);
    }

    #[test]
    fn test_resend_order_and_lazy_prune() {
        let mut inflight = Inflight::default();
        for topic in ["a", "b", "c"] {
            let id = inflight.next_packet_id().unwrap();
            inflight.push(id, Message { topic: topic.into(), payload: Bytes::new(), qos: QoS::AtLeastOnce });
        }
        assert_eq!(inflight.next_resend().map(|(id, _)| id), Some(1));
        assert!(inflight.ack(1).is_some());
        assert!(inflight.ack(1).is_none());
        assert!(inflight.ack(3).is_some());
        assert_eq!(inflight.next_resend().map(|(id, m)| (id, m.topic.to_string())), Some((2, "b".into())));
        assert!(inflight.ack(2).is_some());
        assert!(inflight.next_resend().is_none());
        assert_eq!(inflight.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_until_acked() {
        let s = session(true);
        let (c, mut rx) = client();
        s.attach(c);
        s.subscribe([("cmd".to_string(), QoS::AtLeastOnce)]);

        s.publish("cmd", Bytes::from_static(b"on")).await.unwrap();
        let first = publish_of(rx.recv().await.unwrap());
        assert!(!first.dup);
        assert_eq!(first.qos, QoS::AtLeastOnce);
        let id = first.packet_id.unwrap().get();

        tokio::time::sleep(Duration::from_millis(210)).await;
        let resent = publish_of(rx.recv().await.unwrap());
        assert!(resent.dup);
        assert_eq!(resent.packet_id.unwrap().get(), id);

        s.puback(id);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(s.inflight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_resend_per_tick() {
        let s = session(true);
        let (c, mut rx) = client();
        s.attach(c);
        s.subscribe([("cmd".to_string(), QoS::AtLeastOnce)]);
        for _ in 0..3 {
            s.publish("cmd", Bytes::new()).await.unwrap();
        }
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(210)).await;
        let resent = publish_of(rx.recv().await.unwrap());
        assert_eq!(resent.packet_id.unwrap().get(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_qos0_and_qos2() {
        let s = session(true);
        let (c, mut rx) = client();
        s.attach(c);

        s.publish("anything", Bytes::from_static(b"x")).await.unwrap();
        let p = publish_of(rx.recv().await.unwrap());
        assert_eq!(p.qos, QoS::AtMostOnce);
        assert!(p.packet_id.is_none());
        assert_eq!(s.inflight_len(), 0);

        s.subscribe([("q2".to_string(), QoS::ExactlyOnce)]);
        let e = s.publish("q2", Bytes::new()).await.unwrap_err();
        assert_eq!(e.downcast_ref::<GatewayError>(), Some(&GatewayError::QoS2Unsupported));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_qos1_stays_in_flight() {
        let s = session(false);
        s.subscribe([("cmd".to_string(), QoS::AtLeastOnce)]);
        s.publish("cmd", Bytes::new()).await.unwrap();
        assert_eq!(s.inflight_len(), 1);
        s.publish("other", Bytes::new()).await.unwrap();
        assert_eq!(s.inflight_len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_idempotent() {
        let s = session(true);
        s.inner.scx.sessions.put("d1".into(), Arc::new(s.clone()));
        let (c, _rx) = client();
        s.attach(c.clone());

        s.disconnect();
        s.disconnect();
        assert!(s.is_closed());
        assert!(c.is_disconnected());
        assert!(s.inner.scx.sessions.get("d1").is_none());
        assert!(s.publish("t", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_detach_only_matching_client() {
        let s = session(false);
        let (c1, _rx1) = client();
        let (c2, _rx2) = client();
        s.attach(c1.clone());
        s.attach(c2.clone());
        assert!(!s.detach_if(c1.uid()));
        assert!(s.detach_if(c2.uid()));
        assert!(s.client().is_none());
    }

    #[tokio::test]
    async fn test_on_closed_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let s = session(false);
        let c = calls.clone();
        s.on_closed(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        s.disconnect();
        s.disconnect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // registered after the end, runs at once
        let c = calls.clone();
        s.on_closed(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
