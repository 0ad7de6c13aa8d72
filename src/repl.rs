//! Line grammar of the headless front end.
//!
//! Lines starting with `/` are commands; anything else is sent to the
//! selected session.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};

use conclave_core::{ProjectId, SessionId, SessionMode};
use conclave_runtime::{Command, Snapshot};

pub const HELP: &str = "\
commands:
  /project add <path> [name]   register a git repository and select it
  /project use <name|id>       switch the active project
  /projects                    list projects
  /new <name> [plan|agent]     create a session in the active project
  /sessions                    list sessions of the active project
  /select <session>            bring a session to the foreground
  /start <session>             start a session without sending anything
  /send <session> <text>       send a line to any session
  /output <session>            show a session's retained raw output
  /interrupt                   send Ctrl-C to the foreground session
  /kill <session>              stop a session
  /delete <session>            stop a session and remove its working copy
  /help                        this text
  /quit                        stop every session and exit
anything else is sent to the foreground session";

#[derive(Debug)]
pub enum Input {
    Command(Command),
    Projects,
    Sessions,
    Output(SessionId),
    Help,
    Quit,
    Empty,
}

pub fn parse(line: &str, snapshot: &Snapshot) -> Result<Input> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Input::Command(Command::SendMessage(line.to_string())));
    };

    let (word, args) = split_word(rest);
    let input = match word {
        "project" => {
            let (sub, args) = split_word(args);
            match sub {
                "add" => {
                    let (path, name) = split_word(args);
                    if path.is_empty() {
                        bail!("usage: /project add <path> [name]");
                    }
                    let path = PathBuf::from(path);
                    let name = if name.is_empty() {
                        path.file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| path.display().to_string())
                    } else {
                        name.to_string()
                    };
                    Input::Command(Command::CreateProject { name, path })
                }
                "use" => Input::Command(Command::SwitchProject(resolve_project(args, snapshot)?)),
                _ => bail!("usage: /project add <path> [name] | /project use <name|id>"),
            }
        }
        "projects" => Input::Projects,
        "new" => {
            let (name, mode) = match args.rsplit_once(' ') {
                Some((name, mode)) if mode.parse::<SessionMode>().is_ok() => {
                    (name.trim(), mode.parse::<SessionMode>().ok())
                }
                _ => (args, None),
            };
            if name.is_empty() {
                bail!("usage: /new <name> [plan|agent]");
            }
            Input::Command(Command::CreateSession {
                name: name.to_string(),
                mode,
            })
        }
        "sessions" => Input::Sessions,
        "select" => Input::Command(Command::SelectSession(resolve_session(args, snapshot)?)),
        "start" => Input::Command(Command::StartSession(resolve_session(args, snapshot)?)),
        "kill" => Input::Command(Command::KillSession(resolve_session(args, snapshot)?)),
        "delete" => Input::Command(Command::DeleteSession(resolve_session(args, snapshot)?)),
        "send" => {
            let (target, text) = split_word(args);
            if text.is_empty() {
                bail!("usage: /send <session> <text>");
            }
            Input::Command(Command::SendMessageTo {
                session_id: resolve_session(target, snapshot)?,
                text: text.to_string(),
            })
        }
        "output" => Input::Output(resolve_session(args, snapshot)?),
        "interrupt" => Input::Command(Command::Interrupt),
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => bail!("unknown command /{other}, try /help"),
    };
    Ok(input)
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (s, ""),
    }
}

/// Match by exact name first, then by full id or a prefix of its short form.
fn resolve_session(key: &str, snapshot: &Snapshot) -> Result<SessionId> {
    let key = key.trim();
    if key.is_empty() {
        bail!("which session?");
    }
    if let Some(s) = snapshot.sessions.iter().find(|s| s.name == key) {
        return Ok(s.id.clone());
    }
    let matches: Vec<&SessionId> = snapshot
        .sessions
        .iter()
        .map(|s| &s.id)
        .filter(|id| id.as_str() == key || id.short().starts_with(key))
        .collect();
    match matches.as_slice() {
        [id] => Ok((*id).clone()),
        [] => Err(anyhow!("no session {key:?} in the active project")),
        _ => Err(anyhow!("{key:?} matches several sessions")),
    }
}

fn resolve_project(key: &str, snapshot: &Snapshot) -> Result<ProjectId> {
    let key = key.trim();
    snapshot
        .projects
        .iter()
        .find(|p| p.name == key || p.id.as_str() == key || p.id.short() == key)
        .map(|p| p.id.clone())
        .ok_or_else(|| anyhow!("no project {key:?}"))
}
