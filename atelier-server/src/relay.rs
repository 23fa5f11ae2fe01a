//! WebSocket fan-out per room, with session fencing.
//!
//! Three control message types (`join`, `session_start`, `session_end`)
//! drive the session lifecycle; everything else relays verbatim to the
//! sender's room peers. Malformed frames are dropped without ceremony.

use crate::session::SessionRegistry;
use crate::tasks::spawn_background;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

type PeerSender = mpsc::UnboundedSender<String>;

/// Per-connection state. Transitions only on `join`.
#[derive(Debug, Default)]
struct ConnState {
    room: Option<String>,
    role: Option<String>,
}

/// Incoming frame envelope. Extra fields are ignored here; passthrough
/// frames relay the original text, not a re-serialization.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    room: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

/// Room-multiplexed WebSocket relay.
pub struct RealtimeRelay {
    registry: Arc<SessionRegistry>,
    autoreset_delay: Duration,
    rooms: Mutex<HashMap<String, HashMap<Uuid, PeerSender>>>,
}

impl RealtimeRelay {
    pub fn new(registry: Arc<SessionRegistry>, autoreset_delay: Duration) -> Self {
        Self {
            registry,
            autoreset_delay,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Drive one accepted socket until it closes.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let conn_id = Uuid::new_v4();
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        // Writer task: everything addressed to this peer funnels through
        // the channel so broadcasts never await the socket.
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let mut conn = ConnState::default();

        while let Some(Ok(message)) = ws_rx.next().await {
            match message {
                Message::Text(text) => {
                    self.handle_frame(conn_id, &tx, &mut conn, &text);
                }
                Message::Close(_) => break,
                // Ping/pong handled by axum; binary frames are not part
                // of the protocol.
                _ => {}
            }
        }

        if let Some(room) = conn.room.take() {
            self.detach_peer(&room, conn_id);
        }
        writer.abort();

        tracing::debug!(conn = %conn_id, "WebSocket closed");
    }

    /// Process one text frame from a connection.
    fn handle_frame(
        self: &Arc<Self>,
        conn_id: Uuid,
        tx: &PeerSender,
        conn: &mut ConnState,
        text: &str,
    ) {
        let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
            tracing::debug!(conn = %conn_id, "Dropping malformed frame");
            return;
        };

        let kind = envelope.kind.clone();
        match kind.as_str() {
            "join" => self.handle_join(conn_id, tx, conn, envelope),
            "session_start" => self.handle_session_start(conn, envelope),
            "session_end" => self.handle_session_end(conn, envelope),
            _ => self.handle_passthrough(conn_id, conn, envelope, text),
        }
    }

    fn handle_join(&self, conn_id: Uuid, tx: &PeerSender, conn: &mut ConnState, env: Envelope) {
        let Some(room) = env.room else {
            tracing::debug!(conn = %conn_id, "join without room");
            return;
        };

        if let Some(previous) = conn.room.take() {
            self.detach_peer(&previous, conn_id);
        }

        self.rooms
            .lock()
            .expect("relay rooms poisoned")
            .entry(room.clone())
            .or_default()
            .insert(conn_id, tx.clone());

        conn.role = env.role;
        conn.room = Some(room.clone());

        tracing::info!(
            conn = %conn_id,
            room = %room,
            role = conn.role.as_deref().unwrap_or(""),
            "Peer joined room"
        );

        // Late joiners converge on the canonical session without asking.
        if let Some(entry) = self.registry.get(&room) {
            let echo = json!({
                "type": "session_start",
                "room": room,
                "session": entry.session_id,
            });
            let _ = tx.send(echo.to_string());
        }
    }

    fn handle_session_start(&self, conn: &ConnState, env: Envelope) {
        let Some(room) = env.room.or_else(|| conn.room.clone()) else {
            return;
        };

        // Fencing: the registry decides; a stale client proposal never
        // mints a second session for a bound room.
        let entry = self.registry.coerce_entry(&room, env.session.as_deref());

        self.broadcast_event(
            &room,
            &json!({
                "type": "session_start",
                "room": room,
                "session": entry.session_id,
            }),
        );
    }

    fn handle_session_end(self: &Arc<Self>, conn: &ConnState, env: Envelope) {
        let Some(room) = env.room.or_else(|| conn.room.clone()) else {
            return;
        };

        self.registry.end(&room);
        self.broadcast_event(&room, &json!({ "type": "session_end", "room": room }));

        // Grace window for slow clients to finish in-flight writes before
        // the room is considered free again.
        let relay = self.clone();
        let delay = self.autoreset_delay;
        spawn_background("session_autoreset", async move {
            tokio::time::sleep(delay).await;
            relay.broadcast_event(&room, &json!({ "type": "session_autoreset", "room": room }));
            Ok(())
        });
    }

    fn handle_passthrough(&self, conn_id: Uuid, conn: &ConnState, env: Envelope, text: &str) {
        let Some(room) = conn.room.clone().or(env.room) else {
            tracing::debug!(conn = %conn_id, kind = %env.kind, "Passthrough without room");
            return;
        };

        self.broadcast_except(&room, conn_id, text);
    }

    /// Send a server-originated event to every peer in a room.
    pub fn broadcast_event(&self, room: &str, event: &serde_json::Value) {
        self.broadcast(room, &event.to_string());
    }

    fn broadcast(&self, room: &str, text: &str) {
        let rooms = self.rooms.lock().expect("relay rooms poisoned");
        if let Some(peers) = rooms.get(room) {
            for tx in peers.values() {
                let _ = tx.send(text.to_string());
            }
        }
    }

    fn broadcast_except(&self, room: &str, except: Uuid, text: &str) {
        let rooms = self.rooms.lock().expect("relay rooms poisoned");
        if let Some(peers) = rooms.get(room) {
            for (id, tx) in peers {
                if *id != except {
                    let _ = tx.send(text.to_string());
                }
            }
        }
    }

    fn detach_peer(&self, room: &str, conn_id: Uuid) {
        let mut rooms = self.rooms.lock().expect("relay rooms poisoned");
        if let Some(peers) = rooms.get_mut(room) {
            peers.remove(&conn_id);
            if peers.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Peer count for a room, for debug inspection.
    pub fn peer_count(&self, room: &str) -> usize {
        self.rooms
            .lock()
            .expect("relay rooms poisoned")
            .get(room)
            .map_or(0, |peers| peers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct TestPeer {
        conn_id: Uuid,
        tx: PeerSender,
        rx: UnboundedReceiver<String>,
        conn: ConnState,
    }

    fn peer() -> TestPeer {
        let (tx, rx) = mpsc::unbounded_channel();
        TestPeer {
            conn_id: Uuid::new_v4(),
            tx,
            rx,
            conn: ConnState::default(),
        }
    }

    fn relay() -> Arc<RealtimeRelay> {
        Arc::new(RealtimeRelay::new(
            Arc::new(SessionRegistry::new()),
            Duration::from_secs(10),
        ))
    }

    fn join(relay: &Arc<RealtimeRelay>, peer: &mut TestPeer, room: &str) {
        let frame = json!({ "type": "join", "room": room, "role": "viewer" }).to_string();
        relay.handle_frame(peer.conn_id, &peer.tx, &mut peer.conn, &frame);
    }

    #[tokio::test]
    async fn join_echoes_bound_session_to_late_joiner() {
        let relay = relay();
        relay.registry.start("R1", Some("abc123de"));

        let mut p = peer();
        join(&relay, &mut p, "R1");

        let echoed: serde_json::Value =
            serde_json::from_str(&p.rx.recv().await.unwrap()).unwrap();
        assert_eq!(echoed["type"], "session_start");
        assert_eq!(echoed["session"], "abc123de");
    }

    #[tokio::test]
    async fn join_without_binding_stays_silent() {
        let relay = relay();
        let mut p = peer();
        join(&relay, &mut p, "R1");
        assert!(p.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn session_start_broadcasts_to_all_peers_including_sender() {
        let relay = relay();
        let mut a = peer();
        let mut b = peer();
        join(&relay, &mut a, "R1");
        join(&relay, &mut b, "R1");

        let frame = json!({ "type": "session_start", "room": "R1", "session": "abc123de" })
            .to_string();
        relay.handle_frame(a.conn_id, &a.tx, &mut a.conn, &frame);

        for p in [&mut a, &mut b] {
            let received: serde_json::Value =
                serde_json::from_str(&p.rx.recv().await.unwrap()).unwrap();
            assert_eq!(received["type"], "session_start");
            assert_eq!(received["session"], "abc123de");
        }
    }

    #[tokio::test]
    async fn session_start_is_fenced_by_existing_binding() {
        let relay = relay();
        relay.registry.start("R1", Some("abc123de"));

        let mut a = peer();
        join(&relay, &mut a, "R1");
        a.rx.recv().await.unwrap(); // drop the join echo

        let frame = json!({ "type": "session_start", "room": "R1", "session": "zzz999xx" })
            .to_string();
        relay.handle_frame(a.conn_id, &a.tx, &mut a.conn, &frame);

        let received: serde_json::Value =
            serde_json::from_str(&a.rx.recv().await.unwrap()).unwrap();
        assert_eq!(received["session"], "abc123de");
    }

    #[tokio::test]
    async fn passthrough_relays_verbatim_to_other_peers_only() {
        let relay = relay();
        let mut a = peer();
        let mut b = peer();
        join(&relay, &mut a, "R1");
        join(&relay, &mut b, "R1");

        let frame = r#"{"type":"pose_update","room":"R1","joints":[1,2,3]}"#;
        relay.handle_frame(a.conn_id, &a.tx, &mut a.conn, frame);

        assert_eq!(b.rx.recv().await.unwrap(), frame);
        assert!(a.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn peers_in_other_rooms_do_not_receive() {
        let relay = relay();
        let mut a = peer();
        let mut b = peer();
        join(&relay, &mut a, "R1");
        join(&relay, &mut b, "R2");

        let frame = r#"{"type":"pose_update"}"#;
        relay.handle_frame(a.conn_id, &a.tx, &mut a.conn, frame);

        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let relay = relay();
        let mut a = peer();
        join(&relay, &mut a, "R1");

        relay.handle_frame(a.conn_id, &a.tx, &mut a.conn, "{nonsense");
        relay.handle_frame(a.conn_id, &a.tx, &mut a.conn, "[1,2]");

        assert!(a.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn session_end_unbinds_and_schedules_autoreset() {
        let relay = relay();
        relay.registry.start("R1", Some("abc123de"));

        let mut a = peer();
        join(&relay, &mut a, "R1");
        a.rx.recv().await.unwrap(); // join echo

        let before = tokio::time::Instant::now();
        let frame = json!({ "type": "session_end", "room": "R1" }).to_string();
        relay.handle_frame(a.conn_id, &a.tx, &mut a.conn, &frame);

        assert!(relay.registry.get("R1").is_none());

        let end: serde_json::Value = serde_json::from_str(&a.rx.recv().await.unwrap()).unwrap();
        assert_eq!(end["type"], "session_end");

        // The autoreset lands only after the grace window.
        let reset: serde_json::Value = serde_json::from_str(&a.rx.recv().await.unwrap()).unwrap();
        assert_eq!(reset["type"], "session_autoreset");
        assert!(before.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn detach_removes_empty_rooms() {
        let relay = relay();
        let mut a = peer();
        join(&relay, &mut a, "R1");
        assert_eq!(relay.peer_count("R1"), 1);

        relay.detach_peer("R1", a.conn_id);
        assert_eq!(relay.peer_count("R1"), 0);
        assert!(relay.rooms.lock().unwrap().is_empty());
    }
}
