// Message history rendering for the Courier CLI
//
// Reads come from the message store; this module only selects and formats.

use chrono::{DateTime, Local, Utc};
use colored::*;
use courier_core::{Message, Receiver};

/// Which slice of the log to show
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversation {
    Pair(String, String),
    Group(String),
}

/// Keep only the most recent `limit` messages, oldest first
pub fn tail(mut messages: Vec<Message>, limit: Option<usize>) -> Vec<Message> {
    if let Some(limit) = limit {
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
    }
    messages
}

pub fn formatted_time(timestamp: f64) -> String {
    let secs = timestamp.trunc() as i64;
    let nanos = (timestamp.fract() * 1e9) as u32;
    let dt = DateTime::from_timestamp(secs, nanos).unwrap_or_else(Utc::now);
    dt.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Plain single-line rendering
pub fn render_line(message: &Message) -> String {
    let target = match &message.receiver {
        Receiver::User { username } => username.clone(),
        Receiver::Group { group_id } => format!("#{}", short_id(group_id)),
    };
    format!(
        "[{}] #{} {} -> {}: {}",
        formatted_time(message.timestamp),
        message.id,
        message.sender,
        target,
        message.text
    )
}

pub fn print_messages(conversation: &Conversation, messages: &[Message]) {
    let title = match conversation {
        Conversation::Pair(a, b) => format!("Conversation between {} and {}", a, b),
        Conversation::Group(id) => format!("Group {}", id),
    };
    println!("{}", title.bold());

    if messages.is_empty() {
        println!("  {}", "No messages".dimmed());
        return;
    }

    for message in messages {
        println!(
            "  {} {} {}",
            formatted_time(message.timestamp).dimmed(),
            format!("{}:", message.sender).cyan(),
            message.text
        );
    }
    println!();
    println!("  {} message(s)", messages.len());
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
