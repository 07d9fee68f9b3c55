use anyhow::Result;
use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;

/// What one line of operator input means
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Abort,
    Status,
    /// Anything else is handed to the response source
    Line(String),
}

pub fn parse_command(line: &str) -> Command {
    let cmd = line.trim();
    if cmd.eq_ignore_ascii_case("ABORT") || cmd.eq_ignore_ascii_case("QUIT") {
        Command::Abort
    } else if cmd.eq_ignore_ascii_case("STATUS") {
        Command::Status
    } else {
        Command::Line(cmd.to_string())
    }
}

/// Read operator commands until EOF or abort
///
/// `ABORT`/`QUIT` raise the abort flag; other lines go to `responses`.
pub fn handle_commands(
    input: impl BufRead,
    abort: Arc<AtomicBool>,
    responses: Sender<String>,
) -> Result<()> {
    for line_res in input.lines() {
        match line_res {
            Ok(line) => match parse_command(&line) {
                Command::Abort => {
                    abort.store(true, Ordering::SeqCst);
                    println!("STATUS ABORTING");
                    io::stdout().flush().ok();
                    break;
                }
                Command::Status => {
                    let state = if abort.load(Ordering::SeqCst) {
                        "ABORTING"
                    } else {
                        "RUNNING"
                    };
                    println!("STATUS {}", state);
                    io::stdout().flush().ok();
                }
                Command::Line(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    if responses.send(text).is_err() {
                        tracing::debug!("No response consumer; ignoring input");
                    }
                }
            },
            Err(e) => {
                eprintln!("stdin read error: {}", e);
                break;
            }
        }
    }
    Ok(())
}

/// Spawn the stdin reader; returns the channel of non-command lines
pub fn spawn_stdin_commands(abort: Arc<AtomicBool>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = io::stdin();
        if let Err(e) = handle_commands(stdin.lock(), abort, tx) {
            tracing::warn!("Command reader stopped: {}", e);
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn abort_and_quit_raise_the_flag() {
        for word in ["ABORT", "quit"] {
            let abort = Arc::new(AtomicBool::new(false));
            let (tx, rx) = mpsc::channel();
            let input = Cursor::new(format!("y\n{}\nn\n", word));

            handle_commands(input, abort.clone(), tx).unwrap();

            assert!(abort.load(Ordering::SeqCst));
            // Reading stops at the abort
            assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["y".to_string()]);
        }
    }

    #[test]
    fn plain_lines_are_forwarded() {
        let abort = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let input = Cursor::new("  y \n\nSTATUS\nescape\n");

        handle_commands(input, abort.clone(), tx).unwrap();

        assert!(!abort.load(Ordering::SeqCst));
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec!["y".to_string(), "escape".to_string()]
        );
    }
}
