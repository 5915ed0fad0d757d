//! Line-oriented command console on stdin.

use std::io::BufRead;
use std::str::FromStr;

use anyhow::Context;
use tracing::{info, warn};

use audioloop_engine::{SessionRegistry, TokenAuthorizationProvider};
use audioloop_ipc::{ControlCommand, FocusEvent, ParseCommandError};

const HELP: &str = "\
commands:
  start [token]        start a session (mic-only without a token)
  stop                 stop the session
  status               request a status report
  volume <0-100>       master volume
  mic-gain <0-100>     microphone gain
  app-gain <0-100>     system audio gain
  mute on|off          mute the microphone
  focus gained|lost|transient|duck
                       simulate an output focus change
  revoke               revoke outstanding capture authorizations
  quit                 stop and exit";

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleLine {
    Control(ControlCommand),
    Focus(FocusEvent),
    Revoke,
    Help,
}

impl FromStr for ConsoleLine {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("help" | "?"), _) => Ok(Self::Help),
            (Some("revoke"), _) => Ok(Self::Revoke),
            (Some("focus"), arg) => {
                let event = match arg {
                    Some("gained") => FocusEvent::Gained,
                    Some("lost") => FocusEvent::LostPermanently,
                    Some("transient") => FocusEvent::LostTransient,
                    Some("duck") => FocusEvent::LostTransientDuckable,
                    Some(other) => {
                        return Err(ParseCommandError::InvalidArgument {
                            command: "focus",
                            value: other.to_string(),
                        })
                    }
                    None => return Err(ParseCommandError::MissingArgument("focus")),
                };
                Ok(Self::Focus(event))
            }
            _ => line.parse().map(Self::Control),
        }
    }
}

/// Read commands from `input` until `quit` or end of input.
pub fn run(
    input: impl BufRead,
    registry: &SessionRegistry,
    provider: &TokenAuthorizationProvider,
) -> anyhow::Result<()> {
    for line in input.lines() {
        let line = line.context("failed to read console input")?;
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<ConsoleLine>() {
            Ok(ConsoleLine::Control(ControlCommand::Shutdown)) => break,
            Ok(ConsoleLine::Control(command)) => {
                registry
                    .send(command)
                    .context("session controller is not accepting commands")?;
            }
            Ok(ConsoleLine::Focus(event)) => match registry.focus() {
                Some(focus) => focus.notify(event),
                None => warn!("No controller installed; focus change dropped"),
            },
            Ok(ConsoleLine::Revoke) => {
                let revoked = provider.revoke_all();
                info!(revoked, "Revoked capture authorizations");
            }
            Ok(ConsoleLine::Help) => println!("{HELP}"),
            Err(e) => println!("{e} (type 'help' for commands)"),
        }
    }
    Ok(())
}
