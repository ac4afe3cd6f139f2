use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{error, info};

use crate::models::IncomingMessage;
use crate::pipeline::{ModerateOptions, Orchestrator};

const CHANNELS: &[&str] = &["general", "gaming", "tech-talk", "random", "support"];

const USERNAMES: &[&str] = &[
    "GamerPro123", "ChatMaster", "StreamFan", "TechGuru", "RandomUser", "NightOwl",
    "CoffeeAddict", "BookWorm", "MusicLover", "Traveler", "Foodie", "Artist",
    "Developer", "Student", "Teacher", "SportsFan", "MovieBuff", "Photographer",
];

const NORMAL_MESSAGES: &[&str] = &[
    "Hey everyone! How's it going?",
    "Just finished a great game session",
    "Anyone know about the new update?",
    "Thanks for the help earlier!",
    "Good morning chat!",
    "What's everyone up to today?",
    "That was an amazing stream!",
    "Can someone help me with this issue?",
    "Love this community",
    "Looking forward to the next event",
    "This feature is really useful",
    "Hope everyone has a good day!",
];

const TOXIC_MESSAGES: &[&str] = &[
    "You're absolutely terrible at this game",
    "Nobody cares about your opinion",
    "Stop being such a noob",
    "This chat is full of idiots",
    "You should just quit playing",
    "Everyone here is so stupid",
    "You're all pathetic losers",
];

const SPAM_MESSAGES: &[&str] = &[
    "FREE MONEY HERE: bit.ly/fake-link",
    "CLICK HERE FOR AMAZING DEALS!!!",
    "CRYPTO INVESTMENT OPPORTUNITY",
    "BUY MY COURSE FOR ONLY $99.99",
    "MAKE $1000 A DAY FROM HOME",
    "LIMITED TIME OFFER - ACT NOW!!!",
    "FREE GIFT CARDS - CLICK HERE NOW",
];

const PII_MESSAGES: &[&str] = &[
    "My email is john.doe@email.com if you want to contact me",
    "Call me at 555-123-4567",
    "I live at 123 Main Street, come by",
    "You can reach me at jane.smith@company.com",
    "My phone is (555) 987-6543",
];

/// Weighted message corpus mimicking live chat traffic.
pub struct MessageGenerator;

impl MessageGenerator {
    /// 70% normal, 15% toxic, 10% spam, 5% PII.
    pub fn generate() -> IncomingMessage {
        let mut rng = rand::thread_rng();
        let roll: u32 = rng.gen_range(0..100);
        let (pool, kind) = match roll {
            0..=69 => (NORMAL_MESSAGES, "normal"),
            70..=84 => (TOXIC_MESSAGES, "toxic"),
            85..=94 => (SPAM_MESSAGES, "spam"),
            _ => (PII_MESSAGES, "pii"),
        };

        let user_index = rng.gen_range(0..USERNAMES.len());
        let body = pool.choose(&mut rng).unwrap_or(&"hello").to_string();
        let channel = CHANNELS.choose(&mut rng).unwrap_or(&"general").to_string();

        let metadata = HashMap::from([("generated".to_string(), kind.to_string())]);

        IncomingMessage::new(
            format!("user_{user_index:04}"),
            Some(USERNAMES[user_index].to_string()),
            channel,
            body,
            None,
            metadata,
        )
        .expect("generated message is always valid")
    }
}

/// Drives synthetic chat through the pipeline at a fixed interval.
/// Started and stopped from the session channel's control verbs; at
/// most one loop runs at a time.
pub struct Simulator {
    orchestrator: Arc<Orchestrator>,
    running: Arc<AtomicBool>,
    interval: Duration,
}

impl Simulator {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            running: Arc::new(AtomicBool::new(false)),
            interval,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the generation loop. Returns false when one is already
    /// running.
    pub fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(interval_ms = self.interval.as_millis() as u64, "chat simulation started");

        let orchestrator = self.orchestrator.clone();
        let running = self.running.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let message = MessageGenerator::generate();
                if let Err(e) = orchestrator
                    .moderate(message, ModerateOptions::default())
                    .await
                {
                    error!(error = %e, "simulated message failed to process");
                }
                tokio::time::sleep(interval).await;
            }
            info!("chat simulation stopped");
        });
        true
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_messages_are_valid() {
        for _ in 0..200 {
            let msg = MessageGenerator::generate();
            assert!(!msg.body.is_empty());
            assert!(CHANNELS.contains(&msg.channel_id.as_str()));
            assert!(msg.user_id.starts_with("user_"));
            assert!(msg.metadata.contains_key("generated"));
        }
    }

    #[test]
    fn generator_covers_all_corpora() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2000 {
            let msg = MessageGenerator::generate();
            seen.insert(msg.metadata["generated"].clone());
        }
        for kind in ["normal", "toxic", "spam", "pii"] {
            assert!(seen.contains(kind), "never generated {kind}");
        }
    }
}
