//! 单条实时连接的发送句柄
//!
//! 传输层（WebSocket）持有接收端，应用层只通过句柄推送事件或要求关闭连接。

use domain::{ConnectionId, Timestamp};
use tokio::sync::mpsc;

use crate::events::ServerEvent;

/// 推给传输层的指令
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(ServerEvent),
    Close { reason: String },
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    connected_at: Timestamp,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(connected_at: Timestamp) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            id: ConnectionId::generate(),
            connected_at,
            sender,
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connected_at(&self) -> Timestamp {
        self.connected_at
    }

    /// 推送事件；连接已关闭时返回 false。
    pub fn emit(&self, event: ServerEvent) -> bool {
        self.sender.send(Outbound::Event(event)).is_ok()
    }

    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.sender.send(Outbound::Close {
            reason: reason.into(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
