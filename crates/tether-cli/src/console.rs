//! Operator console for `tether run`.
//!
//! Supported commands:
//!   help            – show this list
//!   status          – capability table and presence
//!   touch           – simulate a tap on the front head sensor
//!   arrive | leave  – simulate people perception events
//!   override        – toggle presence by hand
//!   quit | exit     – shut down

use std::collections::BTreeMap;
use std::io::Write;

use colored::Colorize;
use serde_json::json;
use tether_kernel::ConnectionSupervisor;
use tether_middleware::PresenceBus;
use tether_types::{CapabilityName, CapabilityStatus, PresenceEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::handlers::{HeadTapped, PersonDetector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Everything the console commands act on.
pub struct Session<'a> {
    pub supervisor: &'a ConnectionSupervisor,
    pub head: &'a HeadTapped,
    pub detector: &'a PersonDetector,
    pub presence: &'a PresenceBus,
}

impl Session<'_> {
    /// Read commands from stdin until `quit`, EOF, or `shutdown` fires.
    pub async fn run(&self, shutdown: &CancellationToken) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("{} ", "tether>".bold().cyan());
            std::io::stdout().flush().ok();

            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    eprintln!("{}: {}", "Read error".red(), e);
                    break;
                }
            };
            if self.execute(line.trim()).await == Flow::Quit {
                break;
            }
        }
    }

    pub async fn execute(&self, cmd: &str) -> Flow {
        match cmd {
            "" => {}
            "help" => print_help(),
            "status" => {
                print_status(&self.supervisor.status());
                println!("  presence : {}", presence_label(self.presence.is_present()));
            }
            "touch" => match self.head.on_touched(1.0).await {
                Some(event) => println!("  {}", event_label(event)),
                None => println!("  {}", "no presence change".dimmed()),
            },
            "arrive" => self.detector.on_just_arrived(&json!(1)),
            "leave" => self.detector.on_just_left(&json!(1)),
            "override" => {
                let event = self.presence.toggle();
                println!("  override: {}", event_label(event));
            }
            "quit" | "exit" => {
                println!("{}", "Goodbye.".green());
                return Flow::Quit;
            }
            other => println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                other.yellow(),
                "help".bold()
            ),
        }
        Flow::Continue
    }
}

fn print_help() {
    println!();
    println!("{}", "Tether Commands".bold().underline());
    println!("  {}          – capability table and presence", "status".bold().cyan());
    println!("  {}           – simulate a head tap", "touch".bold().cyan());
    println!("  {}  – simulate people perception", "arrive  leave".bold().cyan());
    println!("  {}        – toggle presence by hand", "override".bold().cyan());
    println!("  {}     – shut down", "quit  exit".bold().cyan());
    println!();
}

/// One line per capability, as used by `status` and `tether monitor`.
pub fn print_status(status: &BTreeMap<CapabilityName, CapabilityStatus>) {
    for (name, snapshot) in status {
        let marker = if snapshot.is_connected() {
            "[OK]  ".green()
        } else if snapshot.exhausted {
            "[GAVE UP]".red().bold()
        } else {
            "[FAIL]".red()
        };
        let attempts = if snapshot.reconnect_attempts > 0 {
            format!(" (attempt {})", snapshot.reconnect_attempts)
        } else {
            String::new()
        };
        println!("  {marker} {name}: {}{}", snapshot.status, attempts.dimmed());
    }
}

fn presence_label(present: bool) -> colored::ColoredString {
    if present {
        "engaged".green()
    } else {
        "nobody".dimmed()
    }
}

fn event_label(event: PresenceEvent) -> colored::ColoredString {
    match event {
        PresenceEvent::Arrived => "conversation started".green(),
        PresenceEvent::Left => "conversation ended".yellow(),
    }
}
