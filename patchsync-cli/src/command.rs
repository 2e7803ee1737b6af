//! Line commands understood by the interactive client.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command `{0}`, try `help`")]
    Unknown(String),
    #[error("`{command}` needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("`{0}` is not a whole number")]
    InvalidNumber(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemoCommand {
    Add {
        id: Option<String>,
        name: Option<String>,
        x: Option<i64>,
    },
    Remove(Option<String>),
    Rename { id: String, name: String },
    Move { id: String, x: i64 },
    Clear,
    Undo,
    Redo,
    Connect,
    Disconnect,
    Show,
    Pending,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  add [id] [name] [x]   add a node (random id, name \"bla\", x 1)
  remove [id]           remove a node (defaults to the last one added)
  rename <id> <name>    set a node's name
  move <id> <x>         set a node's x
  clear                 remove every node
  undo | redo           step through your own edits
  connect | disconnect  toggle the connection
  show                  print the local document
  pending               list batches awaiting confirmation
  help | quit";

impl DemoCommand {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Ok(None);
        };

        let command = match head.to_ascii_lowercase().as_str() {
            "add" => DemoCommand::Add {
                id: words.next().map(str::to_string),
                name: words.next().map(str::to_string),
                x: words.next().map(number).transpose()?,
            },
            "remove" | "rm" => DemoCommand::Remove(words.next().map(str::to_string)),
            "rename" => {
                let id = required(words.next(), "rename", "a node id")?;
                let name = words.collect::<Vec<_>>().join(" ");
                if name.is_empty() {
                    return Err(CommandError::MissingArgument {
                        command: "rename",
                        argument: "a name",
                    });
                }
                DemoCommand::Rename { id, name }
            }
            "move" => DemoCommand::Move {
                id: required(words.next(), "move", "a node id")?,
                x: number(&required(words.next(), "move", "an x position")?)?,
            },
            "clear" => DemoCommand::Clear,
            "undo" => DemoCommand::Undo,
            "redo" => DemoCommand::Redo,
            "connect" | "start" => DemoCommand::Connect,
            "disconnect" | "stop" => DemoCommand::Disconnect,
            "show" => DemoCommand::Show,
            "pending" => DemoCommand::Pending,
            "help" | "?" => DemoCommand::Help,
            "quit" | "exit" => DemoCommand::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }
}

fn required(
    word: Option<&str>,
    command: &'static str,
    argument: &'static str,
) -> Result<String, CommandError> {
    word.map(str::to_string)
        .ok_or(CommandError::MissingArgument { command, argument })
}

fn number(word: &str) -> Result<i64, CommandError> {
    word.parse()
        .map_err(|_| CommandError::InvalidNumber(word.to_string()))
}
