//! Line commands for the interactive session.

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text: send it as a turn.
    Send(String),
    New,
    List,
    Open(usize),
    Regenerate,
    Edit(usize, String),
    Delete(usize),
    Citations(bool),
    Attach(String),
    Model(String),
    /// Store the text as a pending turn and exit; it runs on next start.
    Defer(String),
    Help,
    Quit,
    Invalid(String),
}

pub const HELP: &str = "\
Commands:
  /new                 start a new conversation
  /list                list saved conversations
  /open <n>            open conversation n from /list
  /regen               regenerate the last answer
  /edit <i> <text>     replace message i and re-run from there
  /delete <i>          delete message i and everything after it
  /citations on|off    toggle citations
  /attach <file>       attach a file to the next message
  /model <id>          select a model
  /defer <text>        save a message to send on next start, then quit
  /quit                exit";

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_string()));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    let command = match (name, args) {
        ("new", "") => Command::New,
        ("list", "") => Command::List,
        ("regen", "") => Command::Regenerate,
        ("help", "") => Command::Help,
        ("quit" | "exit", "") => Command::Quit,
        ("open", n) => match n.parse() {
            Ok(n) => Command::Open(n),
            Err(_) => Command::Invalid("usage: /open <n>".into()),
        },
        ("delete", i) => match i.parse() {
            Ok(i) => Command::Delete(i),
            Err(_) => Command::Invalid("usage: /delete <i>".into()),
        },
        ("edit", args) => match args.split_once(char::is_whitespace) {
            Some((i, text)) if !text.trim().is_empty() => match i.parse() {
                Ok(i) => Command::Edit(i, text.trim().to_string()),
                Err(_) => Command::Invalid("usage: /edit <i> <text>".into()),
            },
            _ => Command::Invalid("usage: /edit <i> <text>".into()),
        },
        ("citations", "on") => Command::Citations(true),
        ("citations", "off") => Command::Citations(false),
        ("citations", _) => Command::Invalid("usage: /citations on|off".into()),
        ("attach", file) if !file.is_empty() => Command::Attach(file.to_string()),
        ("model", id) if !id.is_empty() => Command::Model(id.to_string()),
        ("defer", text) if !text.is_empty() => Command::Defer(text.to_string()),
        _ => Command::Invalid(format!("unknown command: /{}", name)),
    };
    Some(command)
}
