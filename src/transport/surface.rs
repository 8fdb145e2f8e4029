//! Embedded UI surface transport.
//!
//! Models a `postMessage` channel between the host window and one embedded
//! frame. The window receives messages from any frame, so every inbound
//! message is checked against the expected frame identity and, unless the
//! target origin is the `*` wildcard, against the expected origin. Messages
//! failing either check are discarded silently.
//!
//! Surfaces have no native error channel: a dead frame is only observable
//! through RPC timeouts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ErrorHandler, HandlerSlots, MessageHandler, MessageTransport};
use crate::{AppError, Result};

/// Wildcard target origin.
pub const ANY_ORIGIN: &str = "*";

/// Identity of an embedded frame (the `event.source` of a window message).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameId(pub String);

impl FrameId {
    /// Fresh random frame identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Message delivered to the host window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowMessage {
    /// Sending frame.
    pub source: FrameId,
    /// Origin of the sending frame.
    pub origin: String,
    /// Payload.
    pub data: Value,
}

/// Message posted by the host into the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PostedMessage {
    /// Origin the host requires the frame to have.
    pub target_origin: String,
    /// Payload.
    pub data: Value,
}

/// Host side of a window/frame channel.
pub struct SurfaceWindow {
    frame: FrameId,
    inbound: mpsc::UnboundedReceiver<WindowMessage>,
    window_tx: mpsc::UnboundedSender<WindowMessage>,
    frame_tx: mpsc::UnboundedSender<PostedMessage>,
}

impl SurfaceWindow {
    /// Create a host window with one embedded frame served from `frame_origin`.
    #[must_use]
    pub fn channel(frame_origin: impl Into<String>) -> (Self, FramePort) {
        let frame = FrameId::generate();
        let (window_tx, inbound) = mpsc::unbounded_channel();
        let (frame_tx, posts) = mpsc::unbounded_channel();

        let port = FramePort {
            frame: frame.clone(),
            origin: frame_origin.into(),
            window_tx: window_tx.clone(),
            posts,
        };
        let window = Self {
            frame,
            inbound,
            window_tx,
            frame_tx,
        };
        (window, port)
    }

    /// Identity of the embedded frame.
    #[must_use]
    pub fn frame_id(&self) -> &FrameId {
        &self.frame
    }

    /// Sender any script in the page (including other frames) can post with.
    #[must_use]
    pub fn poster(&self) -> mpsc::UnboundedSender<WindowMessage> {
        self.window_tx.clone()
    }
}

/// Frame side of a window/frame channel.
pub struct FramePort {
    frame: FrameId,
    origin: String,
    window_tx: mpsc::UnboundedSender<WindowMessage>,
    posts: mpsc::UnboundedReceiver<PostedMessage>,
}

impl FramePort {
    /// Post `data` to the host window as this frame.
    ///
    /// Returns `false` if the window is gone.
    pub fn post(&self, data: Value) -> bool {
        self.window_tx
            .send(WindowMessage {
                source: self.frame.clone(),
                origin: self.origin.clone(),
                data,
            })
            .is_ok()
    }

    /// Receive the next host post addressed to this frame's origin.
    ///
    /// Posts whose target origin does not match are not delivered, as a
    /// browser would do. Returns `None` once the host side is dropped.
    pub async fn recv(&mut self) -> Option<Value> {
        while let Some(post) = self.posts.recv().await {
            if post.target_origin == ANY_ORIGIN || post.target_origin == self.origin {
                return Some(post.data);
            }
            debug!(target_origin = %post.target_origin, "frame: post for another origin not delivered");
        }
        None
    }

    /// Origin this frame is served from.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// Transport addressing an embedded UI surface.
pub struct SurfaceTransport {
    target_origin: String,
    frame_tx: mpsc::UnboundedSender<PostedMessage>,
    slots: Arc<HandlerSlots>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl SurfaceTransport {
    /// Attach to `window`, accepting only messages from its frame and, for a
    /// non-wildcard `target_origin`, only from that origin.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn attach(window: SurfaceWindow, target_origin: impl Into<String>) -> Self {
        let target_origin = target_origin.into();
        if target_origin == ANY_ORIGIN {
            warn!(
                "surface transport uses wildcard target origin '*'; \
                 messages are posted to any origin the frame navigates to"
            );
        }

        let slots = Arc::new(HandlerSlots::new("surface"));
        let cancel = CancellationToken::new();
        let SurfaceWindow {
            frame,
            mut inbound,
            frame_tx,
            ..
        } = window;

        let pump_slots = Arc::clone(&slots);
        let pump_cancel = cancel.clone();
        let expected_origin = target_origin.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = pump_cancel.cancelled() => break,
                    msg = inbound.recv() => {
                        let Some(msg) = msg else { break };
                        if accepts(&frame, &expected_origin, &msg) {
                            pump_slots.dispatch_message(msg.data);
                        } else {
                            debug!(origin = %msg.origin, "surface: message from foreign source discarded");
                        }
                    }
                }
            }
        });

        Self {
            target_origin,
            frame_tx,
            slots,
            closed: AtomicBool::new(false),
            cancel,
        }
    }
}

/// Sender-identity and origin filter.
fn accepts(frame: &FrameId, target_origin: &str, msg: &WindowMessage) -> bool {
    if &msg.source != frame {
        return false;
    }
    target_origin == ANY_ORIGIN || msg.origin == target_origin
}

impl MessageTransport for SurfaceTransport {
    fn send(&self, message: Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.frame_tx
            .send(PostedMessage {
                target_origin: self.target_origin.clone(),
                data: message,
            })
            .map_err(|_| AppError::Transport("surface frame detached".into()))
    }

    fn on_message(&self, handler: MessageHandler) {
        self.slots.set_message(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        // Surfaces never raise errors; the handler is kept for symmetry.
        self.slots.set_error(handler);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        debug!("surface transport closed");
    }

    fn kind(&self) -> &'static str {
        "surface"
    }
}
