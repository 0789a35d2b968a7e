//! 会话房间
//!
//! 一对用户对应两个房间键 `conversation_{a}_{b}` 与 `conversation_{b}_{a}`，
//! 两边各自拼出来的键都能收到消息。房间只在本进程内有效。

use std::collections::{HashMap, HashSet};

use domain::{ConnectionId, UserId};
use tokio::sync::RwLock;

use crate::connection::ConnectionHandle;
use crate::events::ServerEvent;

pub fn room_keys_for(a: UserId, b: UserId) -> [String; 2] {
    [
        format!("conversation_{a}_{b}"),
        format!("conversation_{b}_{a}"),
    ]
}

/// `key` 是否是 `a` 与 `b` 之间的会话房间
pub fn is_conversation_room(key: &str, a: UserId, b: UserId) -> bool {
    room_keys_for(a, b).iter().any(|candidate| candidate == key)
}

/// 用户的个人房间
pub fn personal_room(user: UserId) -> String {
    format!("user_{user}")
}

#[derive(Default)]
struct RoomTable {
    rooms: HashMap<String, HashMap<ConnectionId, ConnectionHandle>>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

impl RoomTable {
    fn join(&mut self, handle: &ConnectionHandle, key: &str) {
        self.rooms
            .entry(key.to_owned())
            .or_default()
            .insert(handle.id(), handle.clone());
        self.memberships
            .entry(handle.id())
            .or_default()
            .insert(key.to_owned());
    }

    fn leave(&mut self, connection: ConnectionId, key: &str) {
        if let Some(members) = self.rooms.get_mut(key) {
            members.remove(&connection);
            if members.is_empty() {
                self.rooms.remove(key);
            }
        }
        if let Some(keys) = self.memberships.get_mut(&connection) {
            keys.remove(key);
            if keys.is_empty() {
                self.memberships.remove(&connection);
            }
        }
    }
}

#[derive(Default)]
pub struct ConversationRooms {
    table: RwLock<RoomTable>,
}

impl ConversationRooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入两人会话的两个房间，返回以自己在前的那个键。
    pub async fn join(&self, handle: &ConnectionHandle, me: UserId, other: UserId) -> String {
        let keys = room_keys_for(me, other);
        let mut table = self.table.write().await;
        for key in &keys {
            table.join(handle, key);
        }
        let [primary, _] = keys;
        primary
    }

    pub async fn join_key(&self, handle: &ConnectionHandle, key: &str) {
        self.table.write().await.join(handle, key);
    }

    pub async fn leave(&self, connection: ConnectionId, me: UserId, other: UserId) -> String {
        let keys = room_keys_for(me, other);
        let mut table = self.table.write().await;
        for key in &keys {
            table.leave(connection, key);
        }
        let [primary, _] = keys;
        primary
    }

    /// 连接断开时退出所有房间。
    pub async fn leave_all(&self, connection: ConnectionId) {
        let mut table = self.table.write().await;
        let keys: Vec<String> = table
            .memberships
            .get(&connection)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        for key in keys {
            table.leave(connection, &key);
        }
    }

    /// 推送给房间内所有连接，返回投递数量。
    pub async fn broadcast(&self, key: &str, event: &ServerEvent) -> usize {
        let handles: Vec<ConnectionHandle> = self
            .table
            .read()
            .await
            .rooms
            .get(key)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default();
        handles
            .iter()
            .filter(|handle| handle.emit(event.clone()))
            .count()
    }

    pub async fn member_count(&self, key: &str) -> usize {
        self.table.read().await.rooms.get(key).map_or(0, HashMap::len)
    }

    pub async fn rooms_of(&self, connection: ConnectionId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .table
            .read()
            .await
            .memberships
            .get(&connection)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ack() -> ServerEvent {
        ServerEvent::Ack {
            id: 0,
            response: json!({}),
        }
    }

    #[test]
    fn test_room_keys_cover_both_orders() {
        let a = UserId::from(Uuid::new_v4());
        let b = UserId::from(Uuid::new_v4());
        let [ab, ba] = room_keys_for(a, b);
        assert_eq!(ab, format!("conversation_{a}_{b}"));
        assert_eq!(ba, format!("conversation_{b}_{a}"));
        assert_eq!(room_keys_for(b, a), [ba, ab]);
    }

    #[tokio::test]
    async fn test_both_participants_receive_on_either_key() {
        let rooms = ConversationRooms::new();
        let (a, b) = (UserId::from(Uuid::new_v4()), UserId::from(Uuid::new_v4()));
        let (ha, _ra) = ConnectionHandle::new(chrono::Utc::now());
        let (hb, _rb) = ConnectionHandle::new(chrono::Utc::now());

        rooms.join(&ha, a, b).await;
        rooms.join(&hb, b, a).await;

        let [ab, ba] = room_keys_for(a, b);
        assert_eq!(rooms.broadcast(&ab, &ack()).await, 2);
        assert_eq!(rooms.broadcast(&ba, &ack()).await, 2);
    }

    #[tokio::test]
    async fn test_leave_and_leave_all() {
        let rooms = ConversationRooms::new();
        let (a, b, c) = (
            UserId::from(Uuid::new_v4()),
            UserId::from(Uuid::new_v4()),
            UserId::from(Uuid::new_v4()),
        );
        let (handle, _rx) = ConnectionHandle::new(chrono::Utc::now());

        rooms.join(&handle, a, b).await;
        rooms.join(&handle, a, c).await;
        rooms.join_key(&handle, &personal_room(a)).await;
        assert_eq!(rooms.rooms_of(handle.id()).await.len(), 5);

        let key = rooms.leave(handle.id(), a, b).await;
        assert_eq!(rooms.member_count(&key).await, 0);
        assert_eq!(rooms.rooms_of(handle.id()).await.len(), 3);

        rooms.leave_all(handle.id()).await;
        assert!(rooms.rooms_of(handle.id()).await.is_empty());
        assert_eq!(rooms.broadcast(&personal_room(a), &ack()).await, 0);
    }
}
