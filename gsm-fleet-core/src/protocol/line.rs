//! Splits the raw serial byte stream into AT response tokens.
//!
//! Lines are CR/LF terminated. The SMS text prompt (`"> "`) is the one token
//! the modem sends without a line terminator, so it is recognized from the
//! pending buffer once a read chunk has been consumed.

/// Longest line kept before it is force-split.
pub const MAX_LINE_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Line(String),
    Prompt,
}

#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk read from the port and return every complete token.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Token> {
        let mut tokens = Vec::new();
        for &byte in bytes {
            match byte {
                b'\r' | b'\n' => self.flush_line(&mut tokens),
                // Ctrl-Z / ESC echoed back after SMS text entry
                0x1A | 0x1B => {}
                _ => {
                    self.pending.push(byte);
                    if self.pending.len() >= MAX_LINE_LEN {
                        self.flush_line(&mut tokens);
                    }
                }
            }
        }
        if is_prompt(&self.pending) {
            self.pending.clear();
            tokens.push(Token::Prompt);
        }
        tokens
    }

    /// Drop any partial line (used after a timed-out command).
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }

    fn flush_line(&mut self, tokens: &mut Vec<Token>) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if !line.is_empty() {
            tokens.push(Token::Line(line));
        }
    }
}

fn is_prompt(buf: &[u8]) -> bool {
    buf == b">" || buf == b"> "
}
