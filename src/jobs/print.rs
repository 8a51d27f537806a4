//! Print job: prints PDF attachments through the CUPS `lp` command.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::debug;

use crate::dispatch::{Job, JobContext, JobKind};
use crate::mail::IncomingMail;

pub const HELP_TEXT: &str = r#"

Print files to CUPS default printer.

Currently only PDF files given as attachments are printed.
A subject of "help" will be replied to with this help text.

Options can be given in any text/plain part of the mail, they are forwarded verbatim to "lp".
Examples:
    -n N            Print N copies
    -H HH:MM        Print at the specified time.
    -P RANGE        Print the specified range of pages, e.g. 1,3-5,16
    -o media=SIZE   Print in a4 or letter or legal...
    -o fit-to-page  Scale to fit the page.
    -o number-up=N  Print N pages per sheet. Possible values: 2,4,6,9,16

"#;

/// `[print]` configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrintConfig {
    /// Printer command and leading arguments; `-t <name> <opts> -- -` is appended.
    #[serde(default = "default_command")]
    pub command: Vec<String>,
}

impl Default for PrintConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
        }
    }
}

fn default_command() -> Vec<String> {
    vec!["lp".to_string()]
}

/// Builds [`PrintJob`]s.
pub struct PrintJobKind {
    command: Vec<String>,
}

impl PrintJobKind {
    pub fn new(config: &PrintConfig) -> Self {
        Self {
            command: config.command.clone(),
        }
    }
}

impl JobKind for PrintJobKind {
    fn prefix(&self) -> &str {
        "[PRINT] "
    }

    fn create(&self, mail: &IncomingMail) -> anyhow::Result<Box<dyn Job>> {
        Ok(Box::new(PrintJob::parse(mail, self.command.clone())?))
    }
}

/// A document to print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintFile {
    pub filename: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PrintJob {
    command: Vec<String>,
    pub help: bool,
    pub options: Vec<String>,
    pub files: Vec<PrintFile>,
}

impl PrintJob {
    /// Collect help requests, printer options and PDF files from a mail.
    pub fn parse(mail: &IncomingMail, command: Vec<String>) -> anyhow::Result<Self> {
        if command.is_empty() {
            bail!("print command is empty");
        }
        let mut job = Self {
            command,
            help: mail.subject.trim().eq_ignore_ascii_case("help"),
            options: Vec::new(),
            files: Vec::new(),
        };

        for part in &mail.parts {
            let filename = part.effective_filename();
            let ext = filename.rsplit_once('.').map_or(filename.as_str(), |(_, ext)| ext);
            if ext.eq_ignore_ascii_case("txt") {
                match part.text() {
                    Some(text) => job.parse_options(text),
                    None => debug!(filename = %filename, "Parsing error: text part is not UTF-8"),
                }
            } else if ext.eq_ignore_ascii_case("pdf") {
                job.files.push(PrintFile {
                    filename,
                    data: part.body.clone(),
                });
            }
        }
        Ok(job)
    }

    fn parse_options(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            if line.trim_start_matches('-').eq_ignore_ascii_case("help") {
                self.help = true;
            } else if line.starts_with("---") {
                break;
            } else if line.starts_with('-') {
                match split_options(line) {
                    Ok(words) => self.options.extend(words),
                    Err(e) => {
                        debug!(line = %line, error = %e, "Parsing error");
                        break;
                    }
                }
            }
        }
    }

    fn print(&self, file: &PrintFile) -> anyhow::Result<()> {
        debug!(filename = %file.filename, "Printing file");
        let (program, leading) = self
            .command
            .split_first()
            .context("print command is empty")?;

        let mut child = Command::new(program)
            .args(leading)
            .arg("-t")
            .arg(&file.filename)
            .args(&self.options)
            .args(["--", "-"])
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {program}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&file.data)
                .with_context(|| format!("failed to send {} to {program}", file.filename))?;
        }
        let status = child
            .wait()
            .with_context(|| format!("failed to wait for {program}"))?;
        if !status.success() {
            bail!("{program} failed for {}: {status}", file.filename);
        }
        Ok(())
    }
}

impl Job for PrintJob {
    fn handle(&mut self, ctx: &mut JobContext) -> anyhow::Result<()> {
        debug!("New job from {}", ctx.sender());
        if self.help {
            debug!("Requested help");
            ctx.respond(HELP_TEXT, Vec::new(), false);
        }
        for file in &self.files {
            self.print(file)?;
        }
        ctx.set_success(true);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("No closing quotation")]
    UnclosedQuote,
    #[error("No escaped character")]
    TrailingEscape,
}

/// Split a line into words with POSIX shell quoting rules.
pub fn split_options(line: &str) -> Result<Vec<String>, SplitError> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(SplitError::UnclosedQuote),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(SplitError::UnclosedQuote),
                        },
                        Some(c) => word.push(c),
                        None => return Err(SplitError::UnclosedQuote),
                    }
                }
            }
            '\\' => {
                in_word = true;
                word.push(chars.next().ok_or(SplitError::TrailingEscape)?);
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}
