//! Full-mesh maintenance for group calls
//!
//! Group calls are a full mesh of p2p links. Joins are gossiped: the member
//! a newcomer reaches answers them directly and announces them to every
//! other connected member, each of which then offers to the newcomer. With
//! n members a join costs one answer plus n-2 fresh offers, so the mesh
//! converges in one round.

use crate::call::{CallError, CallInner, CallSessionController};
use crate::links::envelope;
use crate::signaling::{SignalBody, SignalingEnvelope};
use crate::types::{CallEvent, CallMode, ConnStatus, ParticipantState, PeerId, PeerInfo, UserBrief};

impl CallSessionController {
    /// Pull additional users into the current group call.
    ///
    /// Each invitee gets a participant entry in `connecting` status and a
    /// fresh offer. Already-linked users and the local user are skipped.
    /// Outside a group call this is a logged no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotInCall`] without a session, or a link error
    /// if an offer cannot be produced
    #[tracing::instrument(skip(self, users), fields(count = users.len()))]
    pub async fn invite_users(&self, users: Vec<UserBrief>) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.session.as_ref() else {
            return Err(CallError::NotInCall);
        };
        if session.mode != CallMode::Group {
            tracing::warn!("invite_users outside a group call, ignoring");
            return Ok(());
        }
        let info = self.session_sender_info_locked(&inner);
        for user in users {
            if user.id == self.identity.id || inner.links.contains(&user.id) {
                continue;
            }
            let member = PeerInfo {
                id: user.id.clone(),
                name: user.name.clone(),
                avatar: user.avatar.clone(),
                call_type: info.call_type,
                call_mode: CallMode::Group,
                group_id: info.group_id.clone(),
            };
            if let Some(s) = inner.session.as_mut() {
                s.participants.push(ParticipantState {
                    info: member.clone(),
                    status: ConnStatus::Connecting,
                });
                s.announce_on_answer.push(user.id.clone());
            }
            let _ = self.events.send(CallEvent::ParticipantJoined {
                info: member,
                status: ConnStatus::Connecting,
            });
            tracing::info!(peer = %user.id, "Inviting to group call");
            inner.links.send_offer(&user.id, &info).await?;
        }
        Ok(())
    }

    /// An offer arrived while we are connected in a group call: a newcomer
    /// is joining through us. Answer them and announce them to the rest of
    /// the mesh.
    pub(crate) async fn admit_group_join(
        &self,
        inner: &mut CallInner,
        envelope: &SignalingEnvelope,
        sdp: &str,
    ) -> Result<(), CallError> {
        let joiner = envelope.sender_id.clone();
        tracing::info!(peer = %joiner, "Admitting group join");
        let info = self.session_sender_info_locked(inner);
        inner.links.apply_remote_offer(&joiner, sdp, &info).await?;

        // Connecting until their media comes up; the answer alone does not
        // prove a working path
        if let Some(s) = inner.session.as_mut() {
            match s.participant_mut(&joiner) {
                Some(p) => p.status = ConnStatus::Connecting,
                None => {
                    s.participants.push(ParticipantState {
                        info: envelope.sender_info.clone(),
                        status: ConnStatus::Connecting,
                    });
                    let _ = self.events.send(CallEvent::ParticipantJoined {
                        info: envelope.sender_info.clone(),
                        status: ConnStatus::Connecting,
                    });
                }
            }
        }

        self.broadcast_new_member(inner, &envelope.sender_info).await;
        Ok(())
    }

    /// Announce a member to every other connected peer, exactly once each
    pub(crate) async fn broadcast_new_member(&self, inner: &mut CallInner, member: &PeerInfo) {
        let info = self.session_sender_info_locked(inner);
        let others: Vec<PeerId> = inner
            .links
            .connected_peers()
            .into_iter()
            .filter(|p| *p != member.id)
            .collect();
        for peer in others {
            let body = SignalBody::NewMember {
                member: member.clone(),
            };
            if let Err(e) = self.transport.send(&peer, envelope(&info, body)).await {
                tracing::warn!(peer = %peer, error = %e, "Failed to announce new member");
            }
        }
    }

    /// Another member announced a newcomer: open our own link to them.
    /// Self-announcements and already-linked peers are ignored, so repeated
    /// gossip converges without extra offers.
    pub(crate) async fn handle_new_member(&self, member: PeerInfo) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.session.as_ref() else {
            return Ok(());
        };
        if session.mode != CallMode::Group
            || member.id == self.identity.id
            || inner.links.contains(&member.id)
        {
            return Ok(());
        }
        tracing::info!(peer = %member.id, "New member announced, offering");
        if let Some(s) = inner.session.as_mut() {
            s.participants.push(ParticipantState {
                info: member.clone(),
                status: ConnStatus::Connecting,
            });
        }
        let _ = self.events.send(CallEvent::ParticipantJoined {
            info: member.clone(),
            status: ConnStatus::Connecting,
        });
        let info = self.session_sender_info_locked(&inner);
        inner.links.send_offer(&member.id, &info).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::call::CallSessionController;
    use crate::media::MediaConnector;
    use crate::signaling::SignalingTransport;
    use crate::test_support::{RecordingSignalTransport, ScriptedMedia};
    use crate::types::{CallState, CallType, CoreConfig, LocalIdentity};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn me() -> LocalIdentity {
        LocalIdentity {
            id: PeerId::from("me"),
            name: "Me".into(),
            avatar: "me.png".into(),
        }
    }

    fn brief(id: &str) -> UserBrief {
        UserBrief {
            id: PeerId::from(id),
            name: id.to_uppercase(),
            avatar: format!("{id}.png"),
        }
    }

    fn member(id: &str) -> PeerInfo {
        PeerInfo {
            id: PeerId::from(id),
            name: id.to_uppercase(),
            avatar: format!("{id}.png"),
            call_type: CallType::Audio,
            call_mode: CallMode::Group,
            group_id: Some("g1".into()),
        }
    }

    fn group_env(id: &str, body: SignalBody) -> SignalingEnvelope {
        SignalingEnvelope {
            sender_id: PeerId::from(id),
            sender_info: member(id),
            body,
        }
    }

    fn group_offer(id: &str) -> SignalingEnvelope {
        group_env(
            id,
            SignalBody::Offer {
                sdp: format!("offer-from-{id}"),
            },
        )
    }

    fn group_answer(id: &str) -> SignalingEnvelope {
        group_env(
            id,
            SignalBody::Answer {
                sdp: format!("answer-from-{id}"),
            },
        )
    }

    fn controller() -> (
        CallSessionController,
        Arc<RecordingSignalTransport>,
        Arc<ScriptedMedia>,
    ) {
        let transport = RecordingSignalTransport::new();
        let media = ScriptedMedia::new();
        let ctrl = CallSessionController::new(
            me(),
            transport.clone() as Arc<dyn SignalingTransport>,
            media.clone() as Arc<dyn MediaConnector>,
            CoreConfig::default(),
        );
        (ctrl, transport, media)
    }

    async fn connected_group_call(ctrl: &CallSessionController) {
        ctrl.start_call(brief("g1"), CallType::Audio, CallMode::Group)
            .await
            .unwrap();
        assert_eq!(ctrl.state().await, CallState::Connected);
    }

    #[tokio::test]
    async fn group_call_starts_connected_without_offers() {
        let (ctrl, transport, _media) = controller();
        connected_group_call(&ctrl).await;
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invitees_get_offers_and_are_announced_once_answered() {
        let (ctrl, transport, _media) = controller();
        connected_group_call(&ctrl).await;

        ctrl.invite_users(vec![brief("bob"), brief("carol")])
            .await
            .unwrap();
        assert_eq!(transport.kinds_to(&PeerId::from("bob")), vec!["offer"]);
        assert_eq!(transport.kinds_to(&PeerId::from("carol")), vec!["offer"]);

        let snap = ctrl.snapshot().await;
        assert_eq!(snap.participants.len(), 2);
        assert!(snap
            .participants
            .iter()
            .all(|p| p.status == ConnStatus::Connecting));

        // Bob answers first; nobody else is connected yet, so no broadcast
        ctrl.handle_envelope(group_answer("bob")).await.unwrap();
        assert_eq!(transport.count_kind("new_member"), 0);

        // Carol answers; bob is told about her exactly once
        ctrl.handle_envelope(group_answer("carol")).await.unwrap();
        assert_eq!(transport.count_kind("new_member"), 1);
        assert_eq!(
            transport.kinds_to(&PeerId::from("bob")),
            vec!["offer", "new_member"]
        );
    }

    #[tokio::test]
    async fn inviting_the_same_user_twice_sends_one_offer() {
        let (ctrl, transport, _media) = controller();
        connected_group_call(&ctrl).await;

        ctrl.invite_users(vec![brief("bob")]).await.unwrap();
        ctrl.invite_users(vec![brief("bob")]).await.unwrap();

        assert_eq!(transport.kinds_to(&PeerId::from("bob")), vec!["offer"]);
        assert_eq!(ctrl.snapshot().await.participants.len(), 1);
    }

    #[tokio::test]
    async fn joiner_offer_is_answered_and_gossiped() {
        let (ctrl, transport, media) = controller();
        connected_group_call(&ctrl).await;

        // First joiner: answered, nobody to announce to
        ctrl.handle_envelope(group_offer("dave")).await.unwrap();
        assert_eq!(transport.kinds_to(&PeerId::from("dave")), vec!["answer"]);
        assert_eq!(transport.count_kind("new_member"), 0);
        assert_eq!(
            *media.probe(&PeerId::from("dave")).remote_sdp.lock().unwrap(),
            Some("offer-from-dave".to_string())
        );

        // Second joiner: answered, and dave hears about them
        ctrl.handle_envelope(group_offer("eve")).await.unwrap();
        assert_eq!(transport.kinds_to(&PeerId::from("eve")), vec!["answer"]);
        assert_eq!(
            transport.kinds_to(&PeerId::from("dave")),
            vec!["answer", "new_member"]
        );

        let snap = ctrl.snapshot().await;
        assert_eq!(snap.participants.len(), 2);
        assert!(snap
            .participants
            .iter()
            .all(|p| p.status == ConnStatus::Connecting));
    }

    #[tokio::test]
    async fn announced_member_gets_exactly_one_offer_from_us() {
        let (ctrl, transport, _media) = controller();
        connected_group_call(&ctrl).await;
        ctrl.handle_envelope(group_offer("dave")).await.unwrap();

        let announce = group_env(
            "dave",
            SignalBody::NewMember {
                member: member("eve"),
            },
        );
        ctrl.handle_envelope(announce.clone()).await.unwrap();
        assert_eq!(transport.kinds_to(&PeerId::from("eve")), vec!["offer"]);

        // Repeated gossip about the same member is ignored
        ctrl.handle_envelope(announce).await.unwrap();
        assert_eq!(transport.kinds_to(&PeerId::from("eve")), vec!["offer"]);
    }

    #[tokio::test]
    async fn self_announcements_are_ignored() {
        let (ctrl, transport, _media) = controller();
        connected_group_call(&ctrl).await;
        ctrl.handle_envelope(group_offer("dave")).await.unwrap();
        let sends_before = transport.sent.lock().unwrap().len();

        let announce = group_env(
            "dave",
            SignalBody::NewMember {
                member: member("me"),
            },
        );
        ctrl.handle_envelope(announce).await.unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), sends_before);
    }

    #[tokio::test]
    async fn member_hangup_trims_mesh_and_last_leave_ends_call() {
        let (ctrl, _transport, media) = controller();
        connected_group_call(&ctrl).await;
        ctrl.handle_envelope(group_offer("dave")).await.unwrap();
        ctrl.handle_envelope(group_offer("eve")).await.unwrap();

        ctrl.handle_envelope(group_env("dave", SignalBody::Hangup))
            .await
            .unwrap();
        assert_eq!(ctrl.state().await, CallState::Connected);
        assert_eq!(ctrl.snapshot().await.participants.len(), 1);
        assert!(media
            .probe(&PeerId::from("dave"))
            .closed
            .load(std::sync::atomic::Ordering::SeqCst));

        ctrl.handle_envelope(group_env("eve", SignalBody::Hangup))
            .await
            .unwrap();
        assert_eq!(ctrl.state().await, CallState::Ended);
    }

    #[tokio::test]
    async fn invite_outside_group_call_is_a_no_op() {
        let (ctrl, transport, _media) = controller();
        ctrl.start_call(brief("bob"), CallType::Audio, CallMode::P2p)
            .await
            .unwrap();
        let sends_before = transport.sent.lock().unwrap().len();

        ctrl.invite_users(vec![brief("carol")]).await.unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), sends_before);
    }
}
