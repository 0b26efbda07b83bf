// ABOUTME: Concrete chat transports
// ABOUTME: IRC-over-WebSocket for Twitch-style chat services

pub mod irc;
pub mod protocol;

pub use irc::IrcTransport;
