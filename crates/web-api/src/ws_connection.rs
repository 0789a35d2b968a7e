use application::{ChatGateway, ConnectionHandle, Outbound, Session};
use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket};
use domain::UserProfile;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

/// WebSocket 连接
///
/// 把 socket 与网关会话接起来：
/// - 应用层推送的事件序列化后写回客户端
/// - 客户端文本帧交给网关处理
/// - Ping/Pong 心跳
/// - 断开后结束会话
pub struct WebSocketConnection {
    socket: WebSocket,
    gateway: ChatGateway,
    session: Session,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl WebSocketConnection {
    /// 登记会话；调用前用户必须已通过认证
    pub async fn open(socket: WebSocket, gateway: ChatGateway, user: UserProfile) -> Self {
        let (handle, outbound) = ConnectionHandle::new(chrono::Utc::now());
        let session = gateway.connect(user, handle).await;

        tracing::info!(
            user_id = %session.user().id,
            connection_id = %session.handle().id(),
            subscribed = session.is_subscribed(),
            "WebSocket 连接已建立"
        );

        Self {
            socket,
            gateway,
            session,
            outbound,
        }
    }

    /// 运行连接主循环，直到任意一端结束
    pub async fn run(self) {
        let Self {
            socket,
            gateway,
            session,
            mut outbound,
        } = self;
        let (mut sender, mut incoming) = socket.split();

        // 创建 mpsc channel 来解耦对 sender 的访问
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        // 发送任务：统一处理所有对 WebSocket sender 的写操作
        let mut send_task = tokio::spawn(async move {
            loop {
                let cmd = tokio::select! {
                    Some(cmd) = cmd_rx.recv() => cmd,
                    Some(item) = outbound.recv() => match item {
                        Outbound::Event(event) => match serde_json::to_string(&event) {
                            Ok(json) => WsCommand::SendText(json),
                            Err(err) => {
                                tracing::warn!(error = %err, event = event.name(), "事件序列化失败");
                                continue;
                            }
                        },
                        Outbound::Close { reason } => WsCommand::Close(reason),
                    },
                    else => break,
                };

                match cmd {
                    WsCommand::SendText(text) => {
                        if sender.send(WsMessage::Text(text.into())).await.is_err() {
                            tracing::warn!("Failed to send text message");
                            break;
                        }
                    }
                    WsCommand::SendPong(data) => {
                        if sender.send(WsMessage::Pong(data.into())).await.is_err() {
                            tracing::warn!("Failed to send pong message");
                            break;
                        }
                    }
                    WsCommand::Close(reason) => {
                        let frame = CloseFrame {
                            code: close_code::POLICY,
                            reason: reason.into(),
                        };
                        let _ = sender.send(WsMessage::Close(Some(frame))).await;
                        break;
                    }
                }
            }
            tracing::debug!("WebSocket发送任务结束");
        });

        // 接收循环：借用会话，逐帧交给网关
        let recv_loop = async {
            while let Some(Ok(message)) = incoming.next().await {
                match message {
                    WsMessage::Close(_) => {
                        tracing::debug!("WebSocket收到关闭消息");
                        break;
                    }
                    WsMessage::Ping(data) => {
                        if cmd_tx.send(WsCommand::SendPong(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Text(text) => {
                        gateway.handle_frame(&session, text.as_str()).await;
                    }
                    WsMessage::Binary(_) => {
                        tracing::debug!("忽略二进制帧");
                    }
                }
            }
        };

        tokio::select! {
            _ = &mut send_task => {
                tracing::debug!("WebSocket发送任务完成");
            }
            _ = recv_loop => {
                tracing::debug!("WebSocket接收任务完成");
            }
        }
        send_task.abort();

        let user_id = session.user().id;
        gateway.disconnect(session).await;
        tracing::info!(user_id = %user_id, "WebSocket连接已断开");
    }
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendText(String),
    SendPong(Vec<u8>),
    Close(String),
}
