//! 在线状态注册表
//!
//! 每个用户最多一条活跃连接，后连接的覆盖先连接的；被覆盖的旧连接会被主动关闭。
//! 注销时比对连接 ID，旧连接迟到的断开不会把新连接踢下线。

use std::collections::HashMap;
use std::sync::Arc;

use domain::{ConnectionId, UserId, UserProfile};
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::connection::ConnectionHandle;
use crate::events::{OnlineEntry, OnlineUser, PresenceNotice, PublicProfile, ServerEvent};

#[derive(Debug, Clone)]
struct PresenceEntry {
    profile: UserProfile,
    handle: ConnectionHandle,
}

/// 快照中的一项
#[derive(Debug, Clone)]
pub struct OnlineSession {
    pub profile: UserProfile,
    pub connection_id: ConnectionId,
}

pub struct PresenceRegistry {
    sessions: RwLock<HashMap<UserId, PresenceEntry>>,
    clock: Arc<dyn Clock>,
}

impl PresenceRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// 登记连接，返回被替换掉的旧连接（已通知其关闭）。
    pub async fn register(
        &self,
        profile: UserProfile,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let user_id = profile.id;
        let connection_id = handle.id();
        let previous = self
            .sessions
            .write()
            .await
            .insert(user_id, PresenceEntry { profile, handle });

        let evicted = previous
            .map(|entry| entry.handle)
            .filter(|old| old.id() != connection_id);
        if let Some(old) = &evicted {
            old.close("replaced by a newer connection");
            tracing::info!(
                user_id = %user_id,
                old_connection = %old.id(),
                new_connection = %connection_id,
                "用户重连，旧连接已被替换"
            );
        }
        evicted
    }

    /// 向所有在线连接广播上线事件。
    pub async fn announce_online(&self, profile: &UserProfile, connection_id: ConnectionId) {
        let notice = PresenceNotice {
            user_id: profile.id,
            username: profile.username.clone(),
            zodiac_sign: profile.zodiac_sign.clone(),
            horoscope: profile.horoscope.clone(),
            profile: Some(profile.clone()),
            connection_id: Some(connection_id),
        };
        let delivered = self.broadcast(ServerEvent::UserOnline(notice)).await;
        tracing::info!(user_id = %profile.id, delivered, "广播用户上线");
    }

    /// 注销连接。只有当前登记的正是该连接时才会移除并广播下线，返回是否移除。
    pub async fn unregister(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&user_id) {
                Some(entry) if entry.handle.id() == connection_id => sessions.remove(&user_id),
                _ => None,
            }
        };

        let Some(entry) = removed else {
            tracing::debug!(user_id = %user_id, connection_id = %connection_id, "连接已被替换，跳过注销");
            return false;
        };

        let notice = PresenceNotice {
            user_id,
            username: entry.profile.username.clone(),
            zodiac_sign: entry.profile.zodiac_sign.clone(),
            horoscope: None,
            profile: None,
            connection_id: None,
        };
        self.broadcast(ServerEvent::UserOffline(notice)).await;
        tracing::info!(user_id = %user_id, "用户下线");
        true
    }

    pub async fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.sessions
            .read()
            .await
            .get(&user_id)
            .map(|entry| entry.handle.clone())
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.sessions.read().await.contains_key(&user_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<OnlineSession> {
        self.sessions
            .read()
            .await
            .values()
            .map(|entry| OnlineSession {
                profile: entry.profile.clone(),
                connection_id: entry.handle.id(),
            })
            .collect()
    }

    pub async fn online_entries(&self) -> Vec<OnlineEntry> {
        self.snapshot()
            .await
            .into_iter()
            .map(|s| OnlineEntry {
                user_id: s.profile.id,
                connection_id: s.connection_id,
            })
            .collect()
    }

    pub async fn online_users(&self) -> Vec<OnlineUser> {
        self.snapshot()
            .await
            .into_iter()
            .map(|s| OnlineUser {
                profile: PublicProfile::from(&s.profile),
                connection_id: s.connection_id,
                online: true,
            })
            .collect()
    }

    /// 推送给所有在线连接，返回成功投递的数量。
    pub async fn broadcast(&self, event: ServerEvent) -> usize {
        let handles: Vec<ConnectionHandle> = self
            .sessions
            .read()
            .await
            .values()
            .map(|entry| entry.handle.clone())
            .collect();
        handles
            .iter()
            .filter(|handle| handle.emit(event.clone()))
            .count()
    }

    pub fn now(&self) -> domain::Timestamp {
        self.clock.now()
    }
}
