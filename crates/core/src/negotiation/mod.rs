//! Offer/answer negotiation and key-frame requests over a control channel.
//!
//! ```text
//! offering side:  Idle ──create_offer──▶ OfferSent ──answer(accepted)──▶ Established
//!                                            └──────answer(rejected)──▶ Idle
//! accepting side: Idle ──offer──▶ OfferReceived ──accept_offer──▶ AnswerSent
//! ```
//!
//! PLI may be sent or received in any state.

pub mod channel;
pub mod message;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

pub use channel::{ControlChannel, InMemoryControlChannel, MessageHandler};
pub use message::{ControlMessage, SessionAnswer, SessionOffer};

use crate::config::{DEFAULT_CODEC, VideoSessionConfig};
use crate::error::Result;
use crate::events::Listeners;
use crate::media::VideoEncoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Established,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::OfferSent => "offer-sent",
            Self::OfferReceived => "offer-received",
            Self::AnswerSent => "answer-sent",
            Self::Established => "established",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Session {
    state: NegotiationState,
    local_offer: Option<SessionOffer>,
    remote_offer: Option<SessionOffer>,
    answer: Option<SessionAnswer>,
}

pub struct NegotiationManager {
    channel: Arc<dyn ControlChannel>,
    local_codec: String,
    session: Mutex<Session>,
    encoder: RwLock<Option<Arc<dyn VideoEncoder>>>,
    offer_received: Listeners<SessionOffer>,
    answer_received: Listeners<SessionAnswer>,
    pli_received: Listeners<()>,
}

impl NegotiationManager {
    /// Create a manager for H.264 and subscribe it to `channel`.
    pub fn new(channel: Arc<dyn ControlChannel>) -> Arc<Self> {
        Self::with_codec(channel, DEFAULT_CODEC)
    }

    /// Create a manager that accepts offers only for `local_codec`.
    pub fn with_codec(channel: Arc<dyn ControlChannel>, local_codec: &str) -> Arc<Self> {
        let manager = Arc::new(Self {
            channel: channel.clone(),
            local_codec: local_codec.to_string(),
            session: Mutex::new(Session {
                state: NegotiationState::Idle,
                local_offer: None,
                remote_offer: None,
                answer: None,
            }),
            encoder: RwLock::new(None),
            offer_received: Listeners::new(),
            answer_received: Listeners::new(),
            pli_received: Listeners::new(),
        });

        let weak: Weak<Self> = Arc::downgrade(&manager);
        channel.subscribe(Box::new(move |raw| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_message(raw);
            }
        }));
        tracing::debug!(codec = local_codec, "negotiation manager created");
        manager
    }

    pub fn state(&self) -> NegotiationState {
        self.session.lock().state
    }

    pub fn local_offer(&self) -> Option<SessionOffer> {
        self.session.lock().local_offer.clone()
    }

    pub fn remote_offer(&self) -> Option<SessionOffer> {
        self.session.lock().remote_offer.clone()
    }

    /// The last answer sent or received.
    pub fn answer(&self) -> Option<SessionAnswer> {
        self.session.lock().answer.clone()
    }

    /// Route incoming PLIs to `encoder`.
    pub fn attach_encoder(&self, encoder: Arc<dyn VideoEncoder>) {
        *self.encoder.write() = Some(encoder);
    }

    pub fn on_offer_received<F>(&self, handler: F)
    where
        F: Fn(&SessionOffer) + Send + Sync + 'static,
    {
        self.offer_received.subscribe(handler);
    }

    pub fn on_answer_received<F>(&self, handler: F)
    where
        F: Fn(&SessionAnswer) + Send + Sync + 'static,
    {
        self.answer_received.subscribe(handler);
    }

    pub fn on_pli_received<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.pli_received.subscribe(move |_: &()| handler());
    }

    /// Build an offer from `config`, send it and wait for the answer.
    pub fn create_offer(&self, config: &VideoSessionConfig) -> Result<SessionOffer> {
        let offer = SessionOffer {
            codec: config.codec.clone(),
            profile_level_id: config.profile_level_id.clone(),
            width: config.width,
            height: config.height,
            bitrate: config.bitrate,
            sprop_parameter_sets: config.sprop_parameter_sets.clone().unwrap_or_default(),
        };
        // The answer may arrive on the delivery thread before send returns.
        let previous = {
            let mut session = self.session.lock();
            session.local_offer = Some(offer.clone());
            let previous = session.state;
            self.transition(&mut session, NegotiationState::OfferSent);
            previous
        };
        if let Err(e) = self.send(&ControlMessage::Offer(offer.clone())) {
            let mut session = self.session.lock();
            self.transition(&mut session, previous);
            return Err(e);
        }
        Ok(offer)
    }

    /// Answer `offer`. It is accepted only when its codec matches ours.
    pub fn accept_offer(&self, offer: &SessionOffer) -> Result<SessionAnswer> {
        let accepted = offer.codec == self.local_codec;
        let answer = SessionAnswer {
            accepted,
            codec: offer.codec.clone(),
            profile_level_id: offer.profile_level_id.clone(),
            sprop_parameter_sets: offer.sprop_parameter_sets.clone(),
        };
        if !accepted {
            tracing::warn!(
                offered = %offer.codec,
                local = %self.local_codec,
                "rejecting offer with unsupported codec"
            );
        }
        self.send(&ControlMessage::Answer(answer.clone()))?;

        let mut session = self.session.lock();
        session.answer = Some(answer.clone());
        let next = if accepted {
            NegotiationState::AnswerSent
        } else {
            NegotiationState::Idle
        };
        self.transition(&mut session, next);
        Ok(answer)
    }

    /// Record the peer's answer to our offer.
    pub fn apply_answer(&self, answer: SessionAnswer) {
        {
            let mut session = self.session.lock();
            if session.state == NegotiationState::OfferSent {
                let next = if answer.accepted {
                    NegotiationState::Established
                } else {
                    NegotiationState::Idle
                };
                self.transition(&mut session, next);
            } else {
                tracing::debug!(state = %session.state, "answer without a pending offer");
            }
            session.answer = Some(answer.clone());
        }
        self.answer_received.emit(&answer);
    }

    /// Ask the peer's encoder for a key frame.
    pub fn request_key_frame(&self) -> Result<()> {
        tracing::debug!("sending PLI");
        self.send(&ControlMessage::Pli)
    }

    fn send(&self, message: &ControlMessage) -> Result<()> {
        let json = message.to_json()?;
        self.channel.send_reliable(json)
    }

    fn transition(&self, session: &mut Session, next: NegotiationState) {
        if session.state != next {
            tracing::debug!(from = %session.state, to = %next, "negotiation state changed");
            session.state = next;
        }
    }

    fn handle_message(&self, raw: &str) {
        let message = match ControlMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring malformed control message");
                return;
            }
        };

        match message {
            ControlMessage::Offer(offer) => {
                {
                    let mut session = self.session.lock();
                    session.remote_offer = Some(offer.clone());
                    self.transition(&mut session, NegotiationState::OfferReceived);
                }
                self.offer_received.emit(&offer);
            }
            ControlMessage::Answer(answer) => self.apply_answer(answer),
            ControlMessage::Pli => {
                tracing::debug!("PLI received");
                self.pli_received.emit(&());
                let encoder = self.encoder.read().clone();
                if let Some(encoder) = encoder {
                    encoder.request_key_frame();
                }
            }
        }
    }
}

impl fmt::Debug for NegotiationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationManager")
            .field("local_codec", &self.local_codec)
            .field("state", &self.state())
            .finish()
    }
}
