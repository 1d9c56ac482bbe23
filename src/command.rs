// Line command parsing and dispatch for `bandwidth <subcommand> [args...]`

use crate::bandwidth::BandwidthController;
use crate::protocol::{ResponseCode, ResponseLine};
use crate::tether::TetherStatsFilter;

const PREFIX: &str = "bandwidth";
const SUCCESS: &str = "Bandwidth command succeeded";

/// A parsed `bandwidth` subcommand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Enable,
    Disable,
    SetInterfaceQuota { iface: String, bytes: u64 },
    RemoveInterfaceQuota { iface: String },
    SetSharedQuota { iface: String, bytes: u64 },
    RemoveSharedQuota { iface: String },
    SetInterfaceAlert { iface: String, bytes: u64 },
    RemoveInterfaceAlert { iface: String },
    SetSharedAlert { bytes: u64 },
    RemoveSharedAlert,
    SetGlobalAlert { bytes: u64 },
    RemoveGlobalAlert,
    SetGlobalAlertInForwardChain,
    RemoveGlobalAlertInForwardChain,
    AddNaughtyApps(Vec<String>),
    RemoveNaughtyApps(Vec<String>),
    AddNiceApps(Vec<String>),
    RemoveNiceApps(Vec<String>),
    DataSaver(bool),
    GetTetherStats(TetherStatsFilter),
}

/// Why a line could not be turned into a [`Command`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Parameter(String),
}

impl CommandError {
    fn usage(form: &str) -> Self {
        CommandError::Usage(format!("Usage: {} {}", PREFIX, form))
    }

    fn response(&self) -> ResponseLine {
        let code = match self {
            CommandError::Usage(_) => ResponseCode::CommandSyntaxError,
            CommandError::Parameter(_) => ResponseCode::CommandParameterError,
        };
        ResponseLine::reply(code, self)
    }
}

fn parse_bytes(arg: &str) -> Result<u64, CommandError> {
    arg.parse()
        .map_err(|_| CommandError::Parameter(format!("Invalid byte count {:?}", arg)))
}

/// Exactly `n` arguments after the subcommand, or the usage error
fn expect_args<'a>(args: &'a [&'a str], n: usize, form: &str) -> Result<&'a [&'a str], CommandError> {
    if args.len() == n {
        Ok(args)
    } else {
        Err(CommandError::usage(form))
    }
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (sub, args) = match tokens.as_slice() {
            [prefix, sub, args @ ..] if *prefix == PREFIX => (*sub, args),
            [prefix] if *prefix == PREFIX => {
                return Err(CommandError::usage("<subcommand> [args...]"));
            }
            _ => return Err(CommandError::Usage("Unknown command".to_string())),
        };

        let apps = |form: &str| -> Result<Vec<String>, CommandError> {
            if args.is_empty() {
                return Err(CommandError::usage(form));
            }
            Ok(args.iter().map(|s| s.to_string()).collect())
        };

        let command = match sub {
            "enable" => {
                expect_args(args, 0, "enable")?;
                Command::Enable
            }
            "disable" => {
                expect_args(args, 0, "disable")?;
                Command::Disable
            }
            "setiquota" => {
                let a = expect_args(args, 2, "setiquota <interface> <bytes>")?;
                Command::SetInterfaceQuota {
                    iface: a[0].to_string(),
                    bytes: parse_bytes(a[1])?,
                }
            }
            "removeiquota" => {
                let a = expect_args(args, 1, "removeiquota <interface>")?;
                Command::RemoveInterfaceQuota {
                    iface: a[0].to_string(),
                }
            }
            "setquota" => {
                let a = expect_args(args, 2, "setquota <interface> <bytes>")?;
                Command::SetSharedQuota {
                    iface: a[0].to_string(),
                    bytes: parse_bytes(a[1])?,
                }
            }
            "removequota" => {
                let a = expect_args(args, 1, "removequota <interface>")?;
                Command::RemoveSharedQuota {
                    iface: a[0].to_string(),
                }
            }
            "setinterfacealert" => {
                let a = expect_args(args, 2, "setinterfacealert <interface> <bytes>")?;
                Command::SetInterfaceAlert {
                    iface: a[0].to_string(),
                    bytes: parse_bytes(a[1])?,
                }
            }
            "removeinterfacealert" => {
                let a = expect_args(args, 1, "removeinterfacealert <interface>")?;
                Command::RemoveInterfaceAlert {
                    iface: a[0].to_string(),
                }
            }
            "setsharedalert" => {
                let a = expect_args(args, 1, "setsharedalert <bytes>")?;
                Command::SetSharedAlert {
                    bytes: parse_bytes(a[0])?,
                }
            }
            "removesharedalert" => {
                expect_args(args, 0, "removesharedalert")?;
                Command::RemoveSharedAlert
            }
            "setglobalalert" => {
                let a = expect_args(args, 1, "setglobalalert <bytes>")?;
                Command::SetGlobalAlert {
                    bytes: parse_bytes(a[0])?,
                }
            }
            "removeglobalalert" => {
                expect_args(args, 0, "removeglobalalert")?;
                Command::RemoveGlobalAlert
            }
            "setglobalalertinforwardchain" => {
                expect_args(args, 0, "setglobalalertinforwardchain")?;
                Command::SetGlobalAlertInForwardChain
            }
            "removeglobalalertinforwardchain" => {
                expect_args(args, 0, "removeglobalalertinforwardchain")?;
                Command::RemoveGlobalAlertInForwardChain
            }
            "addnaughtyapps" => Command::AddNaughtyApps(apps("addnaughtyapps <uid>...")?),
            "removenaughtyapps" => Command::RemoveNaughtyApps(apps("removenaughtyapps <uid>...")?),
            "addniceapps" => Command::AddNiceApps(apps("addniceapps <uid>...")?),
            "removeniceapps" => Command::RemoveNiceApps(apps("removeniceapps <uid>...")?),
            "datasaver" => {
                let a = expect_args(args, 1, "datasaver <enable|disable>")?;
                match a[0] {
                    "enable" => Command::DataSaver(true),
                    "disable" => Command::DataSaver(false),
                    other => {
                        return Err(CommandError::Parameter(format!(
                            "Invalid data saver state {:?}",
                            other
                        )));
                    }
                }
            }
            "gettetherstats" => match args {
                [] => Command::GetTetherStats(TetherStatsFilter::default()),
                [a, b] => Command::GetTetherStats(TetherStatsFilter::pair(*a, *b)),
                _ => {
                    return Err(CommandError::usage(
                        "gettetherstats [<interface0> <interface1>]",
                    ));
                }
            },
            _ => {
                return Err(CommandError::Usage(format!(
                    "Unknown {} subcommand {:?}",
                    PREFIX, sub
                )));
            }
        };
        Ok(command)
    }

    fn execute(&self, bw: &BandwidthController) -> crate::error::Result<Vec<ResponseLine>> {
        match self {
            Command::Enable => bw.enable_accounting(false)?,
            Command::Disable => bw.disable_accounting()?,
            Command::SetInterfaceQuota { iface, bytes } => bw.set_interface_quota(iface, *bytes)?,
            Command::RemoveInterfaceQuota { iface } => bw.remove_interface_quota(iface)?,
            Command::SetSharedQuota { iface, bytes } => {
                bw.set_interface_shared_quota(iface, *bytes)?
            }
            Command::RemoveSharedQuota { iface } => bw.remove_interface_shared_quota(iface)?,
            Command::SetInterfaceAlert { iface, bytes } => bw.set_interface_alert(iface, *bytes)?,
            Command::RemoveInterfaceAlert { iface } => bw.remove_interface_alert(iface)?,
            Command::SetSharedAlert { bytes } => bw.set_shared_alert(*bytes)?,
            Command::RemoveSharedAlert => bw.remove_shared_alert()?,
            Command::SetGlobalAlert { bytes } => bw.set_global_alert(*bytes)?,
            Command::RemoveGlobalAlert => bw.remove_global_alert()?,
            Command::SetGlobalAlertInForwardChain => bw.set_global_alert_in_forward_chain()?,
            Command::RemoveGlobalAlertInForwardChain => {
                bw.remove_global_alert_in_forward_chain()?
            }
            Command::AddNaughtyApps(uids) => bw.add_naughty_apps(uids)?,
            Command::RemoveNaughtyApps(uids) => bw.remove_naughty_apps(uids)?,
            Command::AddNiceApps(uids) => bw.add_nice_apps(uids)?,
            Command::RemoveNiceApps(uids) => bw.remove_nice_apps(uids)?,
            Command::DataSaver(enable) => bw.enable_data_saver(*enable)?,
            Command::GetTetherStats(filter) => return bw.tether_stats(filter),
        }
        Ok(vec![ResponseLine::reply(ResponseCode::CommandOkay, SUCCESS)])
    }
}

/// Run one client line against the controller
pub fn dispatch(bw: &BandwidthController, line: &str) -> Vec<ResponseLine> {
    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(e) => {
            log::warn!("Rejected command {:?}: {}", line.trim(), e);
            return vec![e.response()];
        }
    };

    log::debug!("Executing {:?}", command);
    match command.execute(bw) {
        Ok(lines) => lines,
        Err(e) => {
            if let Some(raw) = e.diagnostic() {
                log::debug!("Diagnostic for failed command:\n{}", raw);
            }
            vec![ResponseLine::reply(ResponseCode::OperationFailed, &e)]
        }
    }
}
