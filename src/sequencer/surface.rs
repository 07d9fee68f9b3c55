//! Presentation collaborators
//!
//! Rendering and response capture live outside the acquisition core. The
//! sequencer only talks to these two traits; the crate ships a headless
//! surface that logs what would be drawn and a response source fed with
//! `y`/`n`/`escape` lines by the stdin command reader.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use super::palette::PaletteColor;

/// Fire-and-forget drawing surface, one call per frame
pub trait StimulusSurface {
    fn fixation(&mut self);

    fn word(&mut self, word: &str, background: PaletteColor);

    fn blank(&mut self);

    fn message(&mut self, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Yes,
    No,
    Escape,
}

impl Response {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Some(Response::Yes),
            "n" | "no" => Some(Response::No),
            "escape" | "esc" | "q" | "quit" => Some(Response::Escape),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Response::Yes => "y",
            Response::No => "n",
            Response::Escape => "escape",
        }
    }
}

/// Blocking keypress capture for the memory test
pub trait ResponseSource {
    fn wait_response(&mut self) -> Response;
}

/// Surface that only logs; also counts frames for inspection
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    pub frames: Vec<String>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StimulusSurface for HeadlessSurface {
    fn fixation(&mut self) {
        tracing::debug!("frame: fixation");
        self.frames.push("+".to_string());
    }

    fn word(&mut self, word: &str, background: PaletteColor) {
        tracing::debug!("frame: '{}' on {} ({})", word, background.label, background.hex);
        self.frames.push(format!("{}@{}", word, background.label));
    }

    fn blank(&mut self) {
        tracing::debug!("frame: blank");
        self.frames.push(String::new());
    }

    fn message(&mut self, text: &str) {
        println!("{}", text);
        self.frames.push(text.to_string());
    }
}

/// Responses fed line by line from the command reader
///
/// Closing the line channel counts as escape, and so does a raised abort
/// flag while waiting.
pub struct LineResponses {
    lines: Receiver<String>,
    abort: Arc<AtomicBool>,
}

impl LineResponses {
    pub fn new(lines: Receiver<String>, abort: Arc<AtomicBool>) -> Self {
        Self { lines, abort }
    }
}

impl ResponseSource for LineResponses {
    fn wait_response(&mut self) -> Response {
        loop {
            if self.abort.load(Ordering::SeqCst) {
                return Response::Escape;
            }
            match self.lines.recv_timeout(Duration::from_millis(50)) {
                Ok(line) => match Response::parse(&line) {
                    Some(response) => return response,
                    None => println!("Please answer y or n (escape to abort)"),
                },
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Response::Escape,
            }
        }
    }
}

/// Pre-recorded responses; runs out into `fallback`
#[derive(Debug)]
pub struct ScriptedResponses {
    queue: VecDeque<Response>,
    fallback: Response,
}

impl ScriptedResponses {
    pub fn new(responses: impl IntoIterator<Item = Response>, fallback: Response) -> Self {
        Self {
            queue: responses.into_iter().collect(),
            fallback,
        }
    }

    /// Always answer the same way
    pub fn constant(response: Response) -> Self {
        Self::new([], response)
    }
}

impl ResponseSource for ScriptedResponses {
    fn wait_response(&mut self) -> Response {
        self.queue.pop_front().unwrap_or(self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn line_responses_skip_noise_and_escape_on_close() {
        let (tx, rx) = mpsc::channel();
        let mut responses = LineResponses::new(rx, Arc::new(AtomicBool::new(false)));

        tx.send("maybe".to_string()).unwrap();
        tx.send(" Y ".to_string()).unwrap();
        tx.send("n".to_string()).unwrap();
        assert_eq!(responses.wait_response(), Response::Yes);
        assert_eq!(responses.wait_response(), Response::No);

        drop(tx);
        assert_eq!(responses.wait_response(), Response::Escape);
    }

    #[test]
    fn abort_flag_interrupts_a_pending_response() {
        let (_tx, rx) = mpsc::channel::<String>();
        let abort = Arc::new(AtomicBool::new(false));
        let mut responses = LineResponses::new(rx, abort.clone());

        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            abort.store(true, Ordering::SeqCst);
        });
        assert_eq!(responses.wait_response(), Response::Escape);
        trigger.join().unwrap();
    }

    #[test]
    fn scripted_responses_fall_back_when_exhausted() {
        let mut responses = ScriptedResponses::new([Response::No], Response::Yes);
        assert_eq!(responses.wait_response(), Response::No);
        assert_eq!(responses.wait_response(), Response::Yes);
        assert_eq!(Response::parse("ESC"), Some(Response::Escape));
        assert_eq!(Response::parse("x"), None);
    }
}
