/*============================================================
  Synavera Project: Syn-Till
  Module: syntill_core::prompt
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1
  ------------------------------------------------------------
  Purpose:
    Operator confirmation before an update is staged, as a
    synchronous decision point that tests can replace.

  Security / Safety Notes:
    Anything other than an explicit yes declines.

  Dependencies:
    std::io only.

  Revision History:
    2025-11-12 COD  Authored confirmation prompt.
============================================================*/

use std::io::{self, BufRead, Write};

use crate::version::UpdateDescriptor;

/// Operator answer to "install this update now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Decline,
}

pub trait Confirm {
    fn confirm(&self, descriptor: &UpdateDescriptor) -> Decision;
}

/// Interactive y/N prompt on the controlling terminal.
pub struct TerminalPrompt;

impl Confirm for TerminalPrompt {
    fn confirm(&self, descriptor: &UpdateDescriptor) -> Decision {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(
            stdout,
            "→ Update available: {} → {}",
            descriptor.local_version.as_deref().unwrap_or("unknown"),
            descriptor.remote_version.as_deref().unwrap_or("unknown")
        );
        if let Some(notes) = descriptor.release_notes.as_deref() {
            let _ = writeln!(stdout, "{}", notes.trim());
        }
        let _ = write!(stdout, "Install now? [y/N] ");
        let _ = stdout.flush();
        drop(stdout);

        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => Decision::Decline,
            Ok(_) => parse_answer(&answer),
        }
    }
}

/// Always answers the same way; backs `--yes` and non-interactive boots.
pub struct FixedDecision(pub Decision);

impl Confirm for FixedDecision {
    fn confirm(&self, _descriptor: &UpdateDescriptor) -> Decision {
        self.0
    }
}

fn parse_answer(answer: &str) -> Decision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Decision::Proceed,
        _ => Decision::Decline,
    }
}
