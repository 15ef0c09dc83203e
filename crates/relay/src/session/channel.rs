//! Relay channel.
//!
//! Each session owns one channel. The channel keeps the set of connections
//! subscribed to the session and fans process output out to them. Every
//! member gets its own bounded queue drained by a forwarder task into the
//! connection's outbound queue, so a stalled connection never stalls the
//! producer or the other members. A member whose queue fills up is evicted.
//!
//! Output produced before anyone joined is kept in a small ring buffer and
//! handed to the first member, preceded by a truncation marker if the
//! buffer overflowed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::messages::{
    ErrorMessage, OutputTruncated, SessionAssigned, SessionClosed, SessionOutput,
};
use protocol::{ErrorCode, ServerMessage, SessionKind};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use super::process::OutputChunk;
use super::{ConnectionId, SessionError, SessionId};

/// A connection asking to receive a session's output.
#[derive(Debug, Clone)]
pub struct Subscriber {
    /// Connection identifier.
    pub connection_id: ConnectionId,
    /// User the connection authenticated as.
    pub user_id: String,
    /// The connection's outbound queue.
    pub outbound: mpsc::Sender<ServerMessage>,
}

struct Member {
    user_id: String,
    queue: mpsc::Sender<ServerMessage>,
    closed: Option<oneshot::Sender<ServerMessage>>,
    evicted: Arc<AtomicBool>,
}

/// Output held back until the first member joins.
struct PendingOutput {
    chunks: VecDeque<OutputChunk>,
    bytes: usize,
    capacity: usize,
    dropped: u64,
}

impl PendingOutput {
    fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            capacity,
            dropped: 0,
        }
    }

    /// Appends a chunk, dropping the oldest bytes past capacity.
    fn push(&mut self, chunk: OutputChunk) {
        self.bytes += chunk.bytes.len();
        self.chunks.push_back(chunk);

        while self.bytes > self.capacity {
            let excess = self.bytes - self.capacity;
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.bytes.len() <= excess {
                let len = front.bytes.len();
                self.chunks.pop_front();
                self.bytes -= len;
                self.dropped += len as u64;
            } else {
                front.bytes.drain(..excess);
                self.bytes -= excess;
                self.dropped += excess as u64;
            }
        }
    }
}

struct ChannelInner {
    members: HashMap<ConnectionId, Member>,
    /// `Some` until the first join.
    pending: Option<PendingOutput>,
    closed: bool,
    empty_since: Option<Instant>,
}

/// Membership and fan-out for one session.
pub struct RelayChannel {
    session_id: SessionId,
    kind: SessionKind,
    member_capacity: usize,
    inner: Mutex<ChannelInner>,
    joined: watch::Sender<bool>,
}

impl RelayChannel {
    /// Creates a channel with no members.
    pub fn new(
        session_id: SessionId,
        kind: SessionKind,
        member_capacity: usize,
        pending_capacity: usize,
    ) -> Self {
        Self {
            session_id,
            kind,
            member_capacity: member_capacity.max(1),
            inner: Mutex::new(ChannelInner {
                members: HashMap::new(),
                pending: Some(PendingOutput::new(pending_capacity)),
                closed: false,
                empty_since: Some(Instant::now()),
            }),
            joined: watch::channel(false).0,
        }
    }

    /// Returns the session this channel belongs to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Adds a member.
    ///
    /// The member is sent `session_assigned` first, then any output held
    /// back from before the first join, then live output. Joining twice
    /// only repeats the assignment.
    pub async fn join(&self, subscriber: Subscriber) -> Result<(), SessionError> {
        let assigned = ServerMessage::SessionAssigned(SessionAssigned {
            session_id: self.session_id.clone(),
            kind: self.kind,
        });

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(SessionError::Closed(self.session_id.clone()));
        }

        if let Some(member) = inner.members.get(&subscriber.connection_id) {
            if member.queue.try_send(assigned).is_err() {
                tracing::debug!(
                    session_id = %self.session_id,
                    connection_id = %subscriber.connection_id,
                    "Could not repeat session assignment"
                );
            }
            return Ok(());
        }

        let mut backlog = vec![assigned];
        if let Some(pending) = inner.pending.take() {
            if pending.dropped > 0 {
                backlog.push(ServerMessage::OutputTruncated(OutputTruncated {
                    session_id: self.session_id.clone(),
                    dropped_bytes: pending.dropped,
                }));
            }
            backlog.extend(pending.chunks.into_iter().map(|chunk| self.output(chunk)));
            self.joined.send_replace(true);
        }

        let (queue, rx) = mpsc::channel(self.member_capacity);
        let (closed_tx, closed_rx) = oneshot::channel();
        let evicted = Arc::new(AtomicBool::new(false));

        tokio::spawn(forward(
            self.session_id.clone(),
            backlog,
            rx,
            closed_rx,
            Arc::clone(&evicted),
            subscriber.outbound,
        ));

        inner.members.insert(
            subscriber.connection_id.clone(),
            Member {
                user_id: subscriber.user_id,
                queue,
                closed: Some(closed_tx),
                evicted,
            },
        );
        inner.empty_since = None;

        tracing::debug!(
            session_id = %self.session_id,
            connection_id = %subscriber.connection_id,
            members = inner.members.len(),
            "Connection joined session"
        );

        Ok(())
    }

    /// Removes a member. Returns false if it was not a member.
    pub async fn leave(&self, connection_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.members.remove(connection_id).is_some();
        if removed && inner.members.is_empty() {
            inner.empty_since = Some(Instant::now());
        }
        removed
    }

    /// Delivers a chunk to every member.
    ///
    /// Never waits on a member. Members whose queue is full are evicted and
    /// members whose connection is gone are removed; both are returned so the
    /// caller can treat them as leaves.
    pub async fn broadcast(&self, chunk: OutputChunk) -> Vec<ConnectionId> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Vec::new();
        }

        if let Some(ref mut pending) = inner.pending {
            pending.push(chunk);
            return Vec::new();
        }

        let message = self.output(chunk);
        let mut departed = Vec::new();

        for (connection_id, member) in inner.members.iter() {
            match member.queue.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    member.evicted.store(true, Ordering::SeqCst);
                    tracing::warn!(
                        session_id = %self.session_id,
                        connection_id = %connection_id,
                        "Member queue full, evicting slow consumer"
                    );
                    departed.push(connection_id.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        connection_id = %connection_id,
                        "Member connection gone"
                    );
                    departed.push(connection_id.clone());
                }
            }
        }

        for connection_id in &departed {
            inner.members.remove(connection_id);
        }
        if !departed.is_empty() && inner.members.is_empty() {
            inner.empty_since = Some(Instant::now());
        }

        departed
    }

    /// Sends `session_closed` to every member exactly once and clears the
    /// membership. Returns the number of members notified; zero if the
    /// channel was already closed.
    pub async fn close(&self, closed: SessionClosed) -> usize {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return 0;
        }
        inner.closed = true;
        inner.pending = None;

        let mut notified = 0;
        for (_, mut member) in inner.members.drain() {
            if let Some(tx) = member.closed.take() {
                if tx.send(ServerMessage::SessionClosed(closed.clone())).is_ok() {
                    notified += 1;
                }
            }
        }
        notified
    }

    /// Returns whether anyone ever joined.
    pub fn ever_joined(&self) -> bool {
        *self.joined.borrow()
    }

    /// Waits for the first join.
    pub async fn wait_first_join(&self) {
        let mut rx = self.joined.subscribe();
        let _ = rx.wait_for(|joined| *joined).await;
    }

    /// Returns whether the channel was closed.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Returns whether a connection is a member.
    pub async fn is_member(&self, connection_id: &str) -> bool {
        self.inner.lock().await.members.contains_key(connection_id)
    }

    /// Returns whether any member authenticated as `user_id`.
    pub async fn has_member_for(&self, user_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .members
            .values()
            .any(|m| m.user_id == user_id)
    }

    /// Returns the number of members.
    pub async fn member_count(&self) -> usize {
        self.inner.lock().await.members.len()
    }

    /// Returns how long the channel has had no members, if it has none.
    pub async fn idle_for(&self) -> Option<Duration> {
        self.inner
            .lock()
            .await
            .empty_since
            .map(|since| since.elapsed())
    }

    fn output(&self, chunk: OutputChunk) -> ServerMessage {
        ServerMessage::Output(SessionOutput {
            session_id: self.session_id.clone(),
            origin: chunk.origin,
            bytes: chunk.bytes,
        })
    }
}

/// Moves one member's queue into its connection, in order.
async fn forward(
    session_id: SessionId,
    backlog: Vec<ServerMessage>,
    mut queue: mpsc::Receiver<ServerMessage>,
    closed: oneshot::Receiver<ServerMessage>,
    evicted: Arc<AtomicBool>,
    outbound: mpsc::Sender<ServerMessage>,
) {
    for message in backlog {
        if outbound.send(message).await.is_err() {
            return;
        }
    }

    while let Some(message) = queue.recv().await {
        if outbound.send(message).await.is_err() {
            return;
        }
    }

    // The queue ends when the member is removed: by close, which leaves a
    // final message, or by leave or eviction, which does not.
    let last = match closed.await {
        Ok(message) => message,
        Err(_) if evicted.load(Ordering::SeqCst) => ServerMessage::Error(ErrorMessage {
            code: ErrorCode::SlowConsumer,
            message: "output queue overflowed; rejoin to resume".to_string(),
            session_id: Some(session_id),
            recoverable: true,
        }),
        Err(_) => return,
    };
    let _ = outbound.send(last).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{CloseReason, OutputOrigin};
    use tokio::time::timeout;

    fn channel(member_capacity: usize, pending: usize) -> RelayChannel {
        RelayChannel::new(
            "s1".to_string(),
            SessionKind::InteractiveShell,
            member_capacity,
            pending,
        )
    }

    fn subscriber(id: &str, capacity: usize) -> (Subscriber, mpsc::Receiver<ServerMessage>) {
        let (outbound, rx) = mpsc::channel(capacity);
        (
            Subscriber {
                connection_id: id.to_string(),
                user_id: "alice".to_string(),
                outbound,
            },
            rx,
        )
    }

    fn chunk(bytes: &[u8]) -> OutputChunk {
        OutputChunk {
            origin: OutputOrigin::Stdout,
            bytes: bytes.to_vec(),
        }
    }

    fn closed_message() -> SessionClosed {
        SessionClosed {
            session_id: "s1".to_string(),
            reason: CloseReason::Exited,
            exit_code: Some(0),
            signal: None,
            message: None,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    fn output_bytes(message: ServerMessage) -> Vec<u8> {
        match message {
            ServerMessage::Output(output) => output.bytes,
            other => panic!("expected output, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_sends_assignment_first() {
        let channel = channel(8, 1024);
        let (sub, mut rx) = subscriber("c1", 16);
        channel.join(sub).await.unwrap();

        match next(&mut rx).await {
            ServerMessage::SessionAssigned(assigned) => {
                assert_eq!(assigned.session_id, "s1");
                assert_eq!(assigned.kind, SessionKind::InteractiveShell);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(channel.member_count().await, 1);
        assert!(channel.is_member("c1").await);
        assert!(channel.idle_for().await.is_none());
    }

    #[tokio::test]
    async fn test_pending_output_flushed_to_first_member() {
        let channel = channel(8, 1024);
        channel.broadcast(chunk(b"early ")).await;
        channel.broadcast(chunk(b"bird")).await;

        let (sub, mut rx) = subscriber("c1", 16);
        channel.join(sub).await.unwrap();
        assert!(matches!(next(&mut rx).await, ServerMessage::SessionAssigned(_)));
        assert_eq!(output_bytes(next(&mut rx).await), b"early ");
        assert_eq!(output_bytes(next(&mut rx).await), b"bird");

        assert!(channel.ever_joined());

        // A later member gets no replay.
        let (sub, mut rx2) = subscriber("c2", 16);
        channel.join(sub).await.unwrap();
        assert!(matches!(next(&mut rx2).await, ServerMessage::SessionAssigned(_)));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_overflow_emits_truncation_marker() {
        let channel = channel(8, 8);
        channel.broadcast(chunk(b"0123")).await;
        channel.broadcast(chunk(b"456789")).await;
        channel.broadcast(chunk(b"ab")).await;

        let (sub, mut rx) = subscriber("c1", 16);
        channel.join(sub).await.unwrap();
        assert!(matches!(next(&mut rx).await, ServerMessage::SessionAssigned(_)));
        match next(&mut rx).await {
            ServerMessage::OutputTruncated(marker) => assert_eq!(marker.dropped_bytes, 4),
            other => panic!("expected truncation marker, got {:?}", other),
        }
        let mut kept = output_bytes(next(&mut rx).await);
        kept.extend(output_bytes(next(&mut rx).await));
        assert_eq!(kept, b"456789ab");
    }

    #[test]
    fn test_pending_trims_oversized_chunk() {
        let mut pending = PendingOutput::new(4);
        pending.push(chunk(b"abcdefgh"));
        assert_eq!(pending.bytes, 4);
        assert_eq!(pending.dropped, 4);
        assert_eq!(pending.chunks.front().unwrap().bytes, b"efgh");
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order_for_every_member() {
        let channel = channel(64, 1024);
        let (a, mut rx_a) = subscriber("a", 128);
        let (b, mut rx_b) = subscriber("b", 128);
        channel.join(a).await.unwrap();
        channel.join(b).await.unwrap();

        for i in 0..20u8 {
            assert!(channel.broadcast(chunk(&[i])).await.is_empty());
        }

        for rx in [&mut rx_a, &mut rx_b] {
            assert!(matches!(next(rx).await, ServerMessage::SessionAssigned(_)));
            for i in 0..20u8 {
                assert_eq!(output_bytes(next(rx).await), vec![i]);
            }
        }
    }

    #[tokio::test]
    async fn test_slow_member_evicted_without_blocking_others() {
        let channel = channel(2, 1024);
        // The stalled connection's outbound holds one message and is never read.
        let (slow, mut slow_rx) = subscriber("slow", 1);
        let (fast, mut fast_rx) = subscriber("fast", 256);
        channel.join(slow).await.unwrap();
        channel.join(fast).await.unwrap();

        let mut evicted = Vec::new();
        for i in 0..50u8 {
            let departed = timeout(Duration::from_secs(1), channel.broadcast(chunk(&[i])))
                .await
                .expect("broadcast must not block");
            evicted.extend(departed);
            // Give the fast forwarder a chance to drain.
            tokio::task::yield_now().await;
        }

        assert_eq!(evicted, vec!["slow".to_string()]);
        assert!(!channel.is_member("slow").await);
        assert!(channel.is_member("fast").await);

        assert!(matches!(next(&mut fast_rx).await, ServerMessage::SessionAssigned(_)));
        for i in 0..50u8 {
            assert_eq!(output_bytes(next(&mut fast_rx).await), vec![i]);
        }

        // Once the slow connection catches up it learns why it was dropped.
        let mut saw_notice = false;
        while let Ok(Some(message)) = timeout(Duration::from_secs(1), slow_rx.recv()).await {
            if let ServerMessage::Error(err) = message {
                assert_eq!(err.code, ErrorCode::SlowConsumer);
                saw_notice = true;
            }
        }
        assert!(saw_notice);
    }

    #[tokio::test]
    async fn test_closed_connection_removed_on_broadcast() {
        let channel = channel(8, 1024);
        let (sub, rx) = subscriber("gone", 16);
        channel.join(sub).await.unwrap();
        drop(rx);
        // Let the forwarder notice the closed outbound.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let departed = channel.broadcast(chunk(b"x")).await;
        assert_eq!(departed, vec!["gone".to_string()]);
        assert_eq!(channel.member_count().await, 0);
        assert!(channel.idle_for().await.is_some());
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let channel = channel(8, 1024);
        let (sub, _rx) = subscriber("c1", 16);
        channel.join(sub).await.unwrap();

        assert!(channel.leave("c1").await);
        assert!(!channel.leave("c1").await);
        assert!(!channel.leave("never").await);
        assert!(channel.idle_for().await.is_some());
    }

    #[tokio::test]
    async fn test_close_notifies_each_member_once() {
        let channel = Arc::new(channel(8, 1024));
        let (a, mut rx_a) = subscriber("a", 16);
        let (b, mut rx_b) = subscriber("b", 16);
        channel.join(a).await.unwrap();
        channel.join(b).await.unwrap();
        channel.broadcast(chunk(b"last words")).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let channel = Arc::clone(&channel);
            handles.push(tokio::spawn(async move { channel.close(closed_message()).await }));
        }
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 2);

        for rx in [&mut rx_a, &mut rx_b] {
            assert!(matches!(next(rx).await, ServerMessage::SessionAssigned(_)));
            assert_eq!(output_bytes(next(rx).await), b"last words");
            assert!(matches!(next(rx).await, ServerMessage::SessionClosed(_)));
            // Nothing follows the close notice.
            assert!(!matches!(
                timeout(Duration::from_millis(100), rx.recv()).await,
                Ok(Some(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_join_after_close_fails() {
        let channel = channel(8, 1024);
        channel.close(closed_message()).await;
        assert!(channel.is_closed().await);

        let (sub, _rx) = subscriber("late", 16);
        assert!(matches!(
            channel.join(sub).await,
            Err(SessionError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_rejoin_repeats_assignment_only() {
        let channel = channel(8, 1024);
        let (sub, mut rx) = subscriber("c1", 16);
        channel.join(sub.clone()).await.unwrap();
        channel.join(sub).await.unwrap();

        assert!(matches!(next(&mut rx).await, ServerMessage::SessionAssigned(_)));
        assert!(matches!(next(&mut rx).await, ServerMessage::SessionAssigned(_)));
        assert_eq!(channel.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_has_member_for() {
        let channel = channel(8, 1024);
        let (sub, _rx) = subscriber("c1", 16);
        channel.join(sub).await.unwrap();
        assert!(channel.has_member_for("alice").await);
        assert!(!channel.has_member_for("bob").await);
    }
}
