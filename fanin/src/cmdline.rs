use clap::{Arg, ArgAction, Command};

pub(super) const FORMATS: [&str; 4] = ["raw", "string", "json", "json-split"];

pub(super) fn root_cli() -> Command {
    Command::new("fanin")
        .about("Reliable fan-in consumer over a set of queue servers")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_replay_subcommand())
}

fn add_replay_subcommand() -> Command {
    Command::new("replay")
        .about("Replays a file of payloads through in-memory queue servers and acks every record")
        .arg_required_else_help(true)
        .arg(
            Arg::new("input")
                .long("input")
                .help("File with one payload per line, spread round-robin over the endpoints")
                .required(true)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .help("Spout config JSON file; FANIN_SPOUT_CONFIG (base64 JSON) is used when absent")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new("format")
                .long("format")
                .help("How payloads are decoded into records")
                .value_parser(FORMATS)
                .default_value("string"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        root_cli().debug_assert();
    }

    #[test]
    fn test_replay_args() {
        let matches = root_cli()
            .try_get_matches_from(["fanin", "replay", "--input", "in.txt", "--format", "json"])
            .unwrap();
        let (name, replay) = matches.subcommand().unwrap();
        assert_eq!(name, "replay");
        assert_eq!(replay.get_one::<String>("input").unwrap(), "in.txt");
        assert_eq!(replay.get_one::<String>("format").unwrap(), "json");
        assert!(replay.get_one::<String>("config").is_none());

        assert!(
            root_cli()
                .try_get_matches_from(["fanin", "replay", "--input", "x", "--format", "xml"])
                .is_err()
        );
    }
}
