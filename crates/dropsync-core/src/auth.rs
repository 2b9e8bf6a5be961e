//! Password-authenticated admission over the control stream.
//!
//! A pure state machine: control frames in, control frames out plus an
//! outcome. The engine is responsible for sending the produced frames and
//! for tearing the transport down on rejection. The password is passed in at
//! every step so the latest value is always observed.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::debug;

use dropsync_crypto::{generate_challenge, sign_challenge, verify_challenge, CHALLENGE_SIZE};
use dropsync_types::{AuthFailure, AuthState, ControlFrame};

/// What the engine must do after feeding a frame in.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Nothing decided yet (or the frame was ignored).
    Continue,
    Admitted,
    Skipped,
    /// Terminal: tear down the transport and clear peer state.
    Rejected(AuthFailure),
}

pub struct AuthHandshake {
    state: AuthState,
    opened: bool,
    sent_challenge: Option<[u8; CHALLENGE_SIZE]>,
    failure: Option<AuthFailure>,
}

impl Default for AuthHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthHandshake {
    pub fn new() -> Self {
        Self {
            state: AuthState::Pending,
            opened: false,
            sent_challenge: None,
            failure: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn failure(&self) -> Option<AuthFailure> {
        self.failure
    }

    /// Frames to send when the control stream opens. Safe to call more than
    /// once; only the first call produces anything.
    pub fn on_open(&mut self, initiator: bool, password: Option<&str>) -> Vec<ControlFrame> {
        if self.opened || self.state != AuthState::Pending {
            return Vec::new();
        }
        self.opened = true;
        match password {
            None => vec![ControlFrame::AuthSkip],
            Some(_) if initiator => {
                let nonce = generate_challenge();
                self.sent_challenge = Some(nonce);
                vec![ControlFrame::AuthChallenge {
                    challenge: BASE64.encode(nonce),
                }]
            }
            Some(_) => Vec::new(),
        }
    }

    /// Feed one received auth frame through the rules.
    pub fn on_frame(
        &mut self,
        frame: &ControlFrame,
        password: Option<&str>,
    ) -> (Vec<ControlFrame>, AuthOutcome) {
        if self.state != AuthState::Pending {
            debug!(state = ?self.state, "auth frame after terminal state ignored");
            return (Vec::new(), AuthOutcome::Continue);
        }

        match (password, frame) {
            (None, ControlFrame::AuthSkip) => {
                self.state = AuthState::Skipped;
                (Vec::new(), AuthOutcome::Skipped)
            }
            (None, ControlFrame::AuthChallenge { .. }) => {
                self.reject(AuthFailure::PasswordRequired)
            }
            (None, ControlFrame::AuthResponse { .. }) => {
                self.reject(AuthFailure::PasswordMismatchPeerHasPassword)
            }
            (Some(_), ControlFrame::AuthSkip) => {
                self.reject(AuthFailure::PasswordMismatchPeerHasNone)
            }
            (Some(pw), ControlFrame::AuthChallenge { challenge }) => {
                match BASE64.decode(challenge) {
                    Ok(nonce) => {
                        let signature = BASE64.encode(sign_challenge(&nonce, pw));
                        (
                            vec![ControlFrame::AuthResponse {
                                challenge: challenge.clone(),
                                signature,
                            }],
                            AuthOutcome::Continue,
                        )
                    }
                    Err(_) => self.reject(AuthFailure::WrongPassword),
                }
            }
            (Some(pw), ControlFrame::AuthResponse {
                challenge,
                signature,
            }) => {
                let valid = self.sent_challenge.is_some_and(|sent| {
                    challenge == &BASE64.encode(sent)
                        && BASE64
                            .decode(signature)
                            .is_ok_and(|sig| verify_challenge(&sent, &sig, pw))
                });
                if valid {
                    self.state = AuthState::Admitted;
                    (vec![ControlFrame::AuthOk], AuthOutcome::Admitted)
                } else {
                    self.reject(AuthFailure::WrongPassword)
                }
            }
            (Some(_), ControlFrame::AuthOk) => {
                self.state = AuthState::Admitted;
                (Vec::new(), AuthOutcome::Admitted)
            }
            (_, ControlFrame::AuthFail) => {
                // The peer does not say why; infer the kind from which side
                // of the password the local endpoint is on.
                let reason = if password.is_some() {
                    AuthFailure::WrongPassword
                } else {
                    AuthFailure::PasswordRequired
                };
                self.state = AuthState::Rejected;
                self.failure = Some(reason);
                (Vec::new(), AuthOutcome::Rejected(reason))
            }
            (None, ControlFrame::AuthOk) | (_, ControlFrame::Chat { .. }) => {
                (Vec::new(), AuthOutcome::Continue)
            }
        }
    }

    fn reject(&mut self, reason: AuthFailure) -> (Vec<ControlFrame>, AuthOutcome) {
        self.state = AuthState::Rejected;
        self.failure = Some(reason);
        (vec![ControlFrame::AuthFail], AuthOutcome::Rejected(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge_of(frames: &[ControlFrame]) -> String {
        match &frames[0] {
            ControlFrame::AuthChallenge { challenge } => challenge.clone(),
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    fn response_of(frames: &[ControlFrame]) -> (String, String) {
        match &frames[0] {
            ControlFrame::AuthResponse {
                challenge,
                signature,
            } => (challenge.clone(), signature.clone()),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn both_without_password_skip() {
        let mut a = AuthHandshake::new();
        let mut b = AuthHandshake::new();
        let a_open = a.on_open(true, None);
        let b_open = b.on_open(false, None);
        assert!(matches!(a_open[0], ControlFrame::AuthSkip));
        assert!(matches!(b_open[0], ControlFrame::AuthSkip));

        let (_, out) = a.on_frame(&b_open[0], None);
        assert_eq!(out, AuthOutcome::Skipped);
        let (_, out) = b.on_frame(&a_open[0], None);
        assert_eq!(out, AuthOutcome::Skipped);
    }

    #[test]
    fn matching_passwords_admit_both_sides() {
        let mut initiator = AuthHandshake::new();
        let mut responder = AuthHandshake::new();

        let challenge = initiator.on_open(true, Some("secret"));
        assert!(responder.on_open(false, Some("secret")).is_empty());

        let (response, out) = responder.on_frame(&challenge[0], Some("secret"));
        assert_eq!(out, AuthOutcome::Continue);

        let (ok, out) = initiator.on_frame(&response[0], Some("secret"));
        assert_eq!(out, AuthOutcome::Admitted);
        assert!(matches!(ok[0], ControlFrame::AuthOk));

        let (_, out) = responder.on_frame(&ok[0], Some("secret"));
        assert_eq!(out, AuthOutcome::Admitted);
        assert_eq!(initiator.state(), AuthState::Admitted);
        assert_eq!(responder.state(), AuthState::Admitted);
    }

    #[test]
    fn wrong_password_rejected_by_initiator() {
        let mut initiator = AuthHandshake::new();
        let mut responder = AuthHandshake::new();

        let challenge = initiator.on_open(true, Some("alpha"));
        let (response, _) = responder.on_frame(&challenge[0], Some("beta"));

        let (fail, out) = initiator.on_frame(&response[0], Some("alpha"));
        assert_eq!(out, AuthOutcome::Rejected(AuthFailure::WrongPassword));
        assert!(matches!(fail[0], ControlFrame::AuthFail));

        // The responder learns only auth-fail and infers wrong-password.
        let (_, out) = responder.on_frame(&fail[0], Some("beta"));
        assert_eq!(out, AuthOutcome::Rejected(AuthFailure::WrongPassword));
    }

    #[test]
    fn challenge_without_local_password_is_password_required() {
        let mut handshake = AuthHandshake::new();
        handshake.on_open(false, None);
        let (frames, out) = handshake.on_frame(
            &ControlFrame::AuthChallenge {
                challenge: BASE64.encode([7u8; CHALLENGE_SIZE]),
            },
            None,
        );
        assert_eq!(out, AuthOutcome::Rejected(AuthFailure::PasswordRequired));
        assert!(matches!(frames[0], ControlFrame::AuthFail));
    }

    #[test]
    fn skip_against_local_password_is_mismatch() {
        let mut handshake = AuthHandshake::new();
        handshake.on_open(true, Some("secret"));
        let (_, out) = handshake.on_frame(&ControlFrame::AuthSkip, Some("secret"));
        assert_eq!(
            out,
            AuthOutcome::Rejected(AuthFailure::PasswordMismatchPeerHasNone)
        );
    }

    #[test]
    fn response_against_no_password_is_mismatch() {
        let mut handshake = AuthHandshake::new();
        handshake.on_open(false, None);
        let (_, out) = handshake.on_frame(
            &ControlFrame::AuthResponse {
                challenge: "eA==".into(),
                signature: "eQ==".into(),
            },
            None,
        );
        assert_eq!(
            out,
            AuthOutcome::Rejected(AuthFailure::PasswordMismatchPeerHasPassword)
        );
    }

    #[test]
    fn response_must_echo_the_sent_challenge() {
        let mut initiator = AuthHandshake::new();
        let frames = initiator.on_open(true, Some("secret"));
        let sent = challenge_of(&frames);

        // Signature is valid for a different nonce.
        let other_nonce = [9u8; CHALLENGE_SIZE];
        let signature = BASE64.encode(sign_challenge(&other_nonce, "secret"));
        assert_ne!(sent, BASE64.encode(other_nonce));

        let (_, out) = initiator.on_frame(
            &ControlFrame::AuthResponse {
                challenge: BASE64.encode(other_nonce),
                signature,
            },
            Some("secret"),
        );
        assert_eq!(out, AuthOutcome::Rejected(AuthFailure::WrongPassword));
    }

    #[test]
    fn responder_signs_the_received_challenge() {
        let mut initiator = AuthHandshake::new();
        let mut responder = AuthHandshake::new();
        let frames = initiator.on_open(true, Some("pw"));
        let sent = challenge_of(&frames);
        let (response, _) = responder.on_frame(&frames[0], Some("pw"));
        let (echoed, signature) = response_of(&response);
        assert_eq!(echoed, sent);

        let nonce = BASE64.decode(&sent).unwrap();
        let sig = BASE64.decode(&signature).unwrap();
        assert!(verify_challenge(&nonce, &sig, "pw"));
    }

    #[test]
    fn terminal_states_ignore_further_frames() {
        let mut handshake = AuthHandshake::new();
        handshake.on_open(true, Some("secret"));
        let (_, first) = handshake.on_frame(&ControlFrame::AuthSkip, Some("secret"));
        assert!(matches!(first, AuthOutcome::Rejected(_)));

        let (frames, out) = handshake.on_frame(&ControlFrame::AuthSkip, Some("secret"));
        assert!(frames.is_empty());
        assert_eq!(out, AuthOutcome::Continue);
        assert_eq!(handshake.state(), AuthState::Rejected);
    }

    #[test]
    fn reopen_produces_nothing() {
        let mut handshake = AuthHandshake::new();
        let first = handshake.on_open(true, Some("secret"));
        assert_eq!(first.len(), 1);
        assert!(handshake.on_open(true, Some("secret")).is_empty());
    }
}
