//! One control session: login, dispatch, teardown.
//!
//! Each connection runs a reader task (this module's `run_session`) and a
//! writer task draining the session's mailbox. All outbound frames go
//! through the mailbox, including direct replies, so a receiver observes
//! any single sender's messages in send order.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::chat::Mailbox;
use crate::error::HubError;
use crate::protocol::{ClientMessage, DeliveryKind, ServerMessage};
use crate::protocol_constants::MAX_CONTROL_FRAME_BYTES;
use crate::registry::Participant;

use super::SessionDeps;

/// Whether the session loop keeps going after a message.
#[derive(PartialEq)]
enum Flow {
    Continue,
    Close,
}

type ControlFramed = Framed<TcpStream, LinesCodec>;

/// Drives one control connection from accept to teardown.
pub(crate) async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    deps: Arc<SessionDeps>,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(
        stream,
        LinesCodec::new_with_max_length(MAX_CONTROL_FRAME_BYTES),
    );

    let Some(participant) = login_phase(&mut framed, &deps, &cancel).await else {
        return;
    };
    let uid = participant.uid;
    let username = participant.name.clone();
    log::info!("[Control] {peer} logged in as {username:?} (uid {uid})");

    // Initial frames are queued before the join broadcast so the new
    // session sees login_success first and the list reflects itself.
    participant.mailbox.push(ServerMessage::LoginSuccess { uid });
    participant.mailbox.push(ServerMessage::ParticipantList {
        participants: deps.registry.snapshot(),
    });
    participant.mailbox.push(ServerMessage::History {
        messages: deps.chat.history(),
    });
    deps.chat.fan_out(
        ServerMessage::UserJoined {
            uid,
            username: username.clone(),
        },
        Some(uid),
    );

    let (sink, mut inbound) = framed.split();
    let writer = tokio::spawn(write_loop(
        sink,
        Arc::clone(&participant.mailbox),
        cancel.child_token(),
    ));

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = inbound.next() => item,
        };
        match item {
            None => break,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                participant
                    .mailbox
                    .push(ServerMessage::error_for(&HubError::FrameTooLarge));
                break;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                log::debug!("[Control] {peer} read error: {e}");
                break;
            }
            Some(Ok(line)) => match ClientMessage::parse(&line) {
                Err(err) => {
                    log::debug!("[Control] {peer} sent garbage: {err}");
                    participant.mailbox.push(ServerMessage::error_for(&err));
                }
                Ok(msg) => {
                    if handle_message(&deps, &participant, msg).await == Flow::Close {
                        break;
                    }
                }
            },
        }
    }

    // Teardown: identity first so the leave broadcast reaches only the
    // others, then transfers, then the writer drains what's queued.
    deps.registry.unregister(uid);
    deps.broker.fail_pending_uploads_for(uid);
    deps.chat.fan_out(ServerMessage::UserLeft { uid, username }, None);
    participant.mailbox.close();
    let _ = writer.await;
    log::info!("[Control] {peer} session closed (uid {uid})");
}

/// Reads frames until a valid login arrives.
///
/// Garbage lines get an `error` reply and another chance; any valid
/// non-login message, an oversize frame, or a rejected name closes the
/// connection.
async fn login_phase(
    framed: &mut ControlFramed,
    deps: &SessionDeps,
    cancel: &CancellationToken,
) -> Option<Arc<Participant>> {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return None,
            item = framed.next() => item,
        };
        let line = match item {
            None => return None,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                send_direct(framed, ServerMessage::error_for(&HubError::FrameTooLarge)).await;
                return None;
            }
            Some(Err(LinesCodecError::Io(_))) => return None,
            Some(Ok(line)) => line,
        };

        match ClientMessage::parse(&line) {
            Ok(ClientMessage::Login { username }) => {
                let mailbox = Arc::new(Mailbox::with_default_capacity());
                match deps.registry.register(&username, mailbox) {
                    Ok(participant) => return Some(participant),
                    Err(err) => {
                        send_direct(framed, ServerMessage::error_for(&err)).await;
                        return None;
                    }
                }
            }
            Ok(_) => {
                send_direct(framed, ServerMessage::error_for(&HubError::Unexpected)).await;
                return None;
            }
            Err(err) => {
                send_direct(framed, ServerMessage::error_for(&err)).await;
            }
        }
    }
}

async fn send_direct(framed: &mut ControlFramed, msg: ServerMessage) {
    let _ = framed.send(msg.to_line()).await;
}

/// Dispatches one active-phase message.
async fn handle_message(
    deps: &SessionDeps,
    participant: &Arc<Participant>,
    msg: ClientMessage,
) -> Flow {
    let uid = participant.uid;
    let name = participant.name.as_str();
    let mailbox = &participant.mailbox;

    match msg {
        ClientMessage::Login { .. } => {
            mailbox.push(ServerMessage::error_for(&HubError::Unexpected));
        }
        ClientMessage::Heartbeat => mailbox.push(ServerMessage::HeartbeatAck),
        ClientMessage::Chat { text } => {
            if let Err(err) = deps.chat.send_to_all(uid, name, DeliveryKind::Chat, text) {
                mailbox.push(ServerMessage::error_for(&err));
            }
        }
        ClientMessage::Broadcast { text } => {
            if let Err(err) = deps
                .chat
                .send_to_all(uid, name, DeliveryKind::Broadcast, text)
            {
                mailbox.push(ServerMessage::error_for(&err));
            }
        }
        ClientMessage::Unicast { target_uid, text } => {
            match deps.chat.send_unicast(uid, name, target_uid, text) {
                Ok(()) => mailbox.push(ServerMessage::UnicastSent { target_uid }),
                Err(err) => mailbox.push(ServerMessage::error_for(&err)),
            }
        }
        ClientMessage::GetHistory => mailbox.push(ServerMessage::History {
            messages: deps.chat.history(),
        }),
        ClientMessage::FileOffer {
            fid,
            filename,
            size,
        } => match deps.broker.offer_upload(fid, &filename, size, uid, name).await {
            Ok(port) => mailbox.push(ServerMessage::FileUploadPort { port, fid }),
            Err(err) => mailbox.push(ServerMessage::error_for(&err)),
        },
        ClientMessage::FileRequest { fid } => match deps.broker.request_download(fid, uid).await {
            Ok((port, filename, size)) => mailbox.push(ServerMessage::FileDownloadPort {
                port,
                fid,
                filename,
                size,
            }),
            Err(err) => mailbox.push(ServerMessage::error_for(&err)),
        },
        ClientMessage::PresentStart { topic } => {
            let topic = participant.start_presenting(topic);
            deps.journal.presentation(
                uid,
                name,
                &format!("presentation started ({:?})", topic.as_deref().unwrap_or("")),
            );
            deps.chat.fan_out(
                ServerMessage::PresentStartBroadcast {
                    uid,
                    username: name.to_string(),
                    topic,
                },
                None,
            );
        }
        ClientMessage::PresentStop => {
            if participant.stop_presenting() {
                deps.journal.presentation(uid, name, "presentation stopped");
            }
            deps.chat
                .fan_out(ServerMessage::PresentStopBroadcast { uid }, None);
        }
        ClientMessage::Mute { target_uid } => {
            if deps.registry.lookup(target_uid).is_some() {
                participant.mute(target_uid);
                mailbox.push(ServerMessage::MuteAck {
                    target_uid,
                    muted: true,
                });
            } else {
                mailbox.push(ServerMessage::error_for(&HubError::UnknownParticipant(
                    target_uid,
                )));
            }
        }
        ClientMessage::Unmute { target_uid } => {
            participant.unmute(target_uid);
            mailbox.push(ServerMessage::MuteAck {
                target_uid,
                muted: false,
            });
        }
        ClientMessage::Logout => return Flow::Close,
    }
    Flow::Continue
}

/// Drains the session mailbox onto the socket until close or cancel.
async fn write_loop(
    mut sink: SplitSink<ControlFramed, String>,
    mailbox: Arc<Mailbox>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = mailbox.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if sink.send(msg.to_line()).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
