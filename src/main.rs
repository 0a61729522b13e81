use clap::{Arg, ArgAction, ArgMatches, Command as Cli};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process;

use vpnkeeper_lib::settings_manager::SettingsManager;
use vpnkeeper_lib::single_instance::{try_forward, ControlResponse};
use vpnkeeper_lib::vpn::{ProfileStore, Supervisor, SupervisorConfig, VpnGroup, VpnProfile};
use vpnkeeper_lib::{
  app_dirs, init_logging, resolve_store_path, run_instance, AppError, Command, Dispatcher,
  ProfileChanges, Residency,
};

fn text_arg(name: &'static str, help: &'static str) -> Arg {
  Arg::new(name).long(name).value_name("VALUE").help(help)
}

fn bool_arg(name: &'static str, help: &'static str) -> Arg {
  Arg::new(name)
    .long(name)
    .value_name("BOOL")
    .value_parser(clap::value_parser!(bool))
    .help(help)
}

/// Options shared by `profile add` and `profile edit`.
fn profile_args() -> Vec<Arg> {
  vec![
    text_arg("host", "Gateway host"),
    Arg::new("port")
      .long("port")
      .value_parser(clap::value_parser!(u16))
      .help("Gateway port (default 443)"),
    text_arg("user", "Username"),
    text_arg("realm", "Authentication realm"),
    text_arg("user-cert", "Client certificate file"),
    text_arg("user-key", "Client key file"),
    text_arg("ca-file", "CA certificate file"),
    text_arg("trusted-cert", "SHA-256 fingerprint of the gateway certificate"),
    bool_arg("otp", "Ask for a one-time code on connect"),
    bool_arg("verify-cert", "Verify the gateway certificate"),
    bool_arg("set-routes", "Let the worker configure routes"),
    bool_arg("set-dns", "Let the worker configure DNS"),
    bool_arg("pppd-use-peerdns", "Use DNS servers offered by the peer"),
    bool_arg("insecure-ssl", "Allow insecure TLS settings"),
    bool_arg("debug", "Verbose worker output"),
  ]
}

fn name_arg() -> Arg {
  Arg::new("name").required(true).help("VPN or group name")
}

fn build_cli() -> Cli {
  Cli::new("vpnkeeper")
    .about("Keeps openfortivpn connections under supervision")
    .version(env!("CARGO_PKG_VERSION"))
    .subcommand_required(true)
    .arg(
      Arg::new("config")
        .long("config")
        .global(true)
        .value_parser(clap::value_parser!(PathBuf))
        .help("Profile store to use instead of the default one"),
    )
    .subcommand(
      Cli::new("connect")
        .about("Connect a VPN")
        .arg(name_arg())
        .arg(Arg::new("otp").long("otp").value_name("CODE").help("One-time code")),
    )
    .subcommand(Cli::new("disconnect").about("Disconnect a VPN").arg(name_arg()))
    .subcommand(Cli::new("kill-all").about("Kills all vpn-processes"))
    .subcommand(Cli::new("status").about("Show active connections"))
    .subcommand(Cli::new("list").about("List VPNs and groups"))
    .subcommand(Cli::new("select").about("Select a VPN in the running instance").arg(name_arg()))
    .subcommand(Cli::new("run").about("Run as the supervising instance"))
    .subcommand(
      Cli::new("profile")
        .about("Manage VPN profiles")
        .subcommand_required(true)
        .subcommand(
          Cli::new("add")
            .arg(name_arg())
            .args(profile_args())
            .arg(
              Arg::new("password-stdin")
                .long("password-stdin")
                .action(ArgAction::SetTrue)
                .help("Read the password from stdin"),
            ),
        )
        .subcommand(
          Cli::new("edit")
            .arg(name_arg())
            .arg(text_arg("rename", "New name"))
            .args(profile_args()),
        )
        .subcommand(Cli::new("delete").arg(name_arg()))
        .subcommand(
          Cli::new("copy")
            .arg(name_arg())
            .arg(Arg::new("new-name").required(true)),
        )
        .subcommand(
          Cli::new("set-password")
            .about("Read a new password from stdin and store it encrypted")
            .arg(name_arg()),
        ),
    )
    .subcommand(
      Cli::new("group")
        .about("Manage VPN groups")
        .subcommand_required(true)
        .subcommand(
          Cli::new("add")
            .arg(name_arg())
            .arg(Arg::new("members").num_args(0..).help("Member VPN names")),
        )
        .subcommand(
          Cli::new("edit")
            .arg(name_arg())
            .arg(text_arg("rename", "New name"))
            .arg(Arg::new("members").num_args(0..).help("Replace the member list")),
        )
        .subcommand(Cli::new("delete").arg(name_arg()))
        .subcommand(
          Cli::new("copy")
            .arg(name_arg())
            .arg(Arg::new("new-name").required(true)),
        ),
    )
}

fn string(matches: &ArgMatches, id: &str) -> Option<String> {
  matches.get_one::<String>(id).cloned()
}

fn required(matches: &ArgMatches, id: &str) -> String {
  string(matches, id).unwrap_or_default()
}

fn changes_from(matches: &ArgMatches) -> ProfileChanges {
  let flag = |id: &str| matches.get_one::<bool>(id).copied();
  ProfileChanges {
    rename: matches
      .try_get_one::<String>("rename")
      .ok()
      .flatten()
      .cloned(),
    gateway_host: string(matches, "host"),
    gateway_port: matches.get_one::<u16>("port").copied(),
    username: string(matches, "user"),
    otp: flag("otp"),
    realm: string(matches, "realm"),
    user_cert: string(matches, "user-cert"),
    user_key: string(matches, "user-key"),
    ca_file: string(matches, "ca-file"),
    trusted_cert: string(matches, "trusted-cert"),
    verify_cert: flag("verify-cert"),
    set_routes: flag("set-routes"),
    set_dns: flag("set-dns"),
    pppd_use_peerdns: flag("pppd-use-peerdns"),
    insecure_ssl: flag("insecure-ssl"),
    debug: flag("debug"),
  }
}

fn read_line(prompt: &str) -> std::io::Result<String> {
  eprint!("{prompt}");
  std::io::stderr().flush()?;
  let mut line = String::new();
  std::io::stdin().lock().read_line(&mut line)?;
  Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn fail(message: impl std::fmt::Display) -> ! {
  eprintln!("Error: {message}");
  process::exit(1);
}

fn members(matches: &ArgMatches) -> Vec<String> {
  matches
    .get_many::<String>("members")
    .map(|values| values.cloned().collect())
    .unwrap_or_default()
}

/// Translate parsed arguments into a dispatcher command. `None` for `run`.
fn command_from(matches: &ArgMatches, store_path: &std::path::Path, global: Option<&std::path::Path>) -> Option<Command> {
  let command = match matches.subcommand() {
    Some(("connect", m)) => {
      let name = required(m, "name");
      let mut otp = string(m, "otp");
      if otp.is_none() {
        let needs_otp = ProfileStore::load(store_path).is_ok_and(|mut store| {
          if let Some(global) = global {
            store.merge_global(global);
          }
          store.profile(&name).is_some_and(|p| p.otp)
        });
        if needs_otp {
          otp = Some(read_line(&format!("One-time code for {name}: ")).unwrap_or_else(|e| fail(e)));
        }
      }
      Command::Connect { name, otp }
    }
    Some(("disconnect", m)) => Command::Disconnect {
      name: required(m, "name"),
    },
    Some(("kill-all", _)) => Command::KillAll,
    Some(("status", _)) => Command::Status,
    Some(("list", _)) => Command::List,
    Some(("select", m)) => Command::Select {
      name: required(m, "name"),
    },
    Some(("profile", sub)) => match sub.subcommand() {
      Some(("add", m)) => {
        let name = required(m, "name");
        let changes = changes_from(m);
        let Some(host) = changes.gateway_host.clone() else {
          fail("--host is required when adding a VPN");
        };
        let mut profile = VpnProfile::new(&name, &host, 443);
        changes.apply(&mut profile);
        let password = if m.get_flag("password-stdin") {
          Some(read_line("Password: ").unwrap_or_else(|e| fail(e)))
        } else {
          None
        };
        Command::AddProfile { profile, password }
      }
      Some(("edit", m)) => Command::EditProfile {
        name: required(m, "name"),
        changes: changes_from(m),
      },
      Some(("delete", m)) => Command::DeleteProfile {
        name: required(m, "name"),
      },
      Some(("copy", m)) => Command::CopyProfile {
        name: required(m, "name"),
        new_name: required(m, "new-name"),
      },
      Some(("set-password", m)) => {
        let name = required(m, "name");
        let password = read_line(&format!("Password for {name}: ")).unwrap_or_else(|e| fail(e));
        Command::SetPassword { name, password }
      }
      _ => fail("unknown profile command"),
    },
    Some(("group", sub)) => match sub.subcommand() {
      Some(("add", m)) => Command::AddGroup {
        group: VpnGroup::new(&required(m, "name"), members(m)),
      },
      Some(("edit", m)) => Command::EditGroup {
        name: required(m, "name"),
        rename: string(m, "rename"),
        members: m.contains_id("members").then(|| members(m)),
      },
      Some(("delete", m)) => Command::DeleteGroup {
        name: required(m, "name"),
      },
      Some(("copy", m)) => Command::CopyGroup {
        name: required(m, "name"),
        new_name: required(m, "new-name"),
      },
      _ => fail("unknown group command"),
    },
    Some(("run", _)) => return None,
    _ => fail("no command given"),
  };
  Some(command)
}

fn print_response(response: ControlResponse) -> i32 {
  match response {
    ControlResponse::Ok { outcome } => {
      println!("{outcome}");
      0
    }
    ControlResponse::Raised => 0,
    ControlResponse::Error { message } => {
      eprintln!("Error: {message}");
      1
    }
  }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
  let matches = build_cli().get_matches();
  let config_override = matches.get_one::<PathBuf>("config").cloned();

  let settings = SettingsManager::new().load_settings();
  let store_path = resolve_store_path(config_override.as_deref());
  let global = settings.global_profiles_path.clone();

  let Some(command) = command_from(&matches, &store_path, global.as_deref()) else {
    init_logging(settings.log_level_filter(), Some(&app_dirs::log_file()));
    let code = match run_instance(&settings, &store_path, None, Residency::Resident).await {
      Ok(()) => 0,
      Err(e) if matches!(e.downcast_ref::<AppError>(), Some(AppError::AlreadyRunning)) => {
        eprintln!("{e}");
        0
      }
      Err(e) => fail(e),
    };
    process::exit(code)
  };

  init_logging(settings.log_level_filter(), None);
  let socket = app_dirs::control_socket();

  if let Some(path) = &config_override {
    match try_forward(&socket, Command::UseConfig { path: path.clone() }).await {
      Ok(Some(ControlResponse::Error { message })) => fail(message),
      Ok(_) => {}
      Err(e) => fail(e),
    }
  }

  match try_forward(&socket, command.clone()).await {
    Ok(Some(response)) => process::exit(print_response(response)),
    Ok(None) => {}
    Err(e) => fail(e),
  }

  // No running instance: connecting makes this process the supervisor until
  // the connection ends, everything else runs once.
  if matches!(command, Command::Connect { .. }) {
    match run_instance(&settings, &store_path, Some(command), Residency::UntilIdle).await {
      Ok(()) => process::exit(0),
      Err(e) => fail(e),
    }
  }

  let supervisor = std::sync::Arc::new(Supervisor::new(SupervisorConfig::from(&settings)));
  let (dispatcher, load_error) = Dispatcher::open(&store_path, global, supervisor);
  if let Some(e) = load_error {
    eprintln!("Warning: {e}");
  }
  match dispatcher.execute(command).await {
    Ok(outcome) => println!("{outcome}"),
    Err(e) => fail(e),
  }
}
