use std::fmt;

use thiserror::Error;

/// One line of the scheduler's stdin protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(String),
    Stop(String),
    Suspend(String),
    Resume(String),
    Hide(String),
    Show(String),
    Mute(String),
    Unmute(String),
    ToggleMute(String),
    Controller { game: String, controller: i32 },
    Status,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("'{command}' expects {expected}")]
    Arguments {
        command: &'static str,
        expected: &'static str,
    },
    #[error("invalid controller id '{0}'")]
    Controller(String),
}

impl Command {
    /// Parses a whitespace-separated command line. Keywords are case-insensitive.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut words = line.split_whitespace();
        let keyword = words.next().ok_or(ParseError::Empty)?.to_ascii_lowercase();
        let args: Vec<&str> = words.collect();

        let game = |command: &'static str| match args.as_slice() {
            [id] => Ok(id.to_string()),
            _ => Err(ParseError::Arguments {
                command,
                expected: "a game id",
            }),
        };

        let command = match keyword.as_str() {
            "start" => Command::Start(game("start")?),
            "stop" => Command::Stop(game("stop")?),
            "suspend" => Command::Suspend(game("suspend")?),
            "resume" => Command::Resume(game("resume")?),
            "hide" => Command::Hide(game("hide")?),
            "show" => Command::Show(game("show")?),
            "mute" => Command::Mute(game("mute")?),
            "unmute" => Command::Unmute(game("unmute")?),
            "toggle-mute" => Command::ToggleMute(game("toggle-mute")?),
            "controller" => match args.as_slice() {
                [id, controller] => Command::Controller {
                    game: id.to_string(),
                    controller: controller
                        .parse()
                        .map_err(|_| ParseError::Controller(controller.to_string()))?,
                },
                _ => {
                    return Err(ParseError::Arguments {
                        command: "controller",
                        expected: "a game id and a controller id",
                    })
                }
            },
            "status" | "quit" if !args.is_empty() => {
                return Err(ParseError::Arguments {
                    command: if keyword == "status" { "status" } else { "quit" },
                    expected: "no arguments",
                })
            }
            "status" => Command::Status,
            "quit" => Command::Quit,
            _ => return Err(ParseError::Unknown(keyword)),
        };
        Ok(command)
    }

    /// The game this command targets, if any.
    pub fn game(&self) -> Option<&str> {
        match self {
            Command::Start(id)
            | Command::Stop(id)
            | Command::Suspend(id)
            | Command::Resume(id)
            | Command::Hide(id)
            | Command::Show(id)
            | Command::Mute(id)
            | Command::Unmute(id)
            | Command::ToggleMute(id)
            | Command::Controller { game: id, .. } => Some(id),
            Command::Status | Command::Quit => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start(id) => write!(f, "start {id}"),
            Command::Stop(id) => write!(f, "stop {id}"),
            Command::Suspend(id) => write!(f, "suspend {id}"),
            Command::Resume(id) => write!(f, "resume {id}"),
            Command::Hide(id) => write!(f, "hide {id}"),
            Command::Show(id) => write!(f, "show {id}"),
            Command::Mute(id) => write!(f, "mute {id}"),
            Command::Unmute(id) => write!(f, "unmute {id}"),
            Command::ToggleMute(id) => write!(f, "toggle-mute {id}"),
            Command::Controller { game, controller } => write!(f, "controller {game} {controller}"),
            Command::Status => f.write_str("status"),
            Command::Quit => f.write_str("quit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_game_commands() {
        assert_eq!(Command::parse("start hades"), Ok(Command::Start("hades".into())));
        assert_eq!(Command::parse("  suspend   celeste \n"), Ok(Command::Suspend("celeste".into())));
        assert_eq!(Command::parse("toggle-mute hades"), Ok(Command::ToggleMute("hades".into())));
        assert_eq!(Command::parse("HIDE hades"), Ok(Command::Hide("hades".into())));
    }

    #[test]
    fn game_ids_keep_their_case() {
        assert_eq!(Command::parse("stop Hades"), Ok(Command::Stop("Hades".into())));
    }

    #[test]
    fn parses_controller_assignment() {
        assert_eq!(
            Command::parse("controller hades 2"),
            Ok(Command::Controller {
                game: "hades".into(),
                controller: 2
            })
        );
        assert_eq!(
            Command::parse("controller hades -1"),
            Ok(Command::Controller {
                game: "hades".into(),
                controller: -1
            })
        );
    }

    #[test]
    fn rejects_bad_controller_id() {
        assert_eq!(
            Command::parse("controller hades two"),
            Err(ParseError::Controller("two".into()))
        );
    }

    #[test]
    fn parses_bare_commands() {
        assert_eq!(Command::parse("status"), Ok(Command::Status));
        assert_eq!(Command::parse("quit"), Ok(Command::Quit));
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(matches!(
            Command::parse("start"),
            Err(ParseError::Arguments { command: "start", .. })
        ));
        assert!(matches!(
            Command::parse("mute a b"),
            Err(ParseError::Arguments { command: "mute", .. })
        ));
        assert!(matches!(
            Command::parse("controller hades"),
            Err(ParseError::Arguments { command: "controller", .. })
        ));
        assert!(matches!(
            Command::parse("quit now"),
            Err(ParseError::Arguments { command: "quit", .. })
        ));
    }

    #[test]
    fn rejects_empty_and_unknown() {
        assert_eq!(Command::parse("   "), Err(ParseError::Empty));
        assert_eq!(Command::parse("launch hades"), Err(ParseError::Unknown("launch".into())));
    }

    #[test]
    fn game_target() {
        assert_eq!(Command::parse("show hades").unwrap().game(), Some("hades"));
        assert_eq!(Command::Status.game(), None);
    }

    #[test]
    fn display_matches_input_syntax() {
        for line in ["start hades", "toggle-mute celeste", "controller hades 3", "status"] {
            assert_eq!(Command::parse(line).unwrap().to_string(), line);
        }
    }
}
