use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[clap(
        short,
        long,
        help = "Path to the JSON config file.",
        default_value = "esquery.json"
    )]
    pub config: PathBuf,

    #[clap(
        short,
        long,
        help = "Listen address (host:port) of the health and metrics server.",
        default_value = "0.0.0.0:8080"
    )]
    pub listen: String,

    #[clap(long, help = "Run a single cycle, print its records and exit.")]
    pub once: bool,

    #[clap(long, help = "Log as JSON lines, tagged with the measurement being processed.")]
    pub log_json: bool,
}

#[must_use]
pub fn parse_args() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["esquery"]);
        assert_eq!(args.config, PathBuf::from("esquery.json"));
        assert_eq!(args.listen, "0.0.0.0:8080");
        assert!(!args.once);
        assert!(!args.log_json);
    }

    #[test]
    fn flags() {
        let args = Args::parse_from(["esquery", "-c", "/etc/esquery.json", "--once", "--log-json"]);
        assert_eq!(args.config, PathBuf::from("/etc/esquery.json"));
        assert!(args.once);
        assert!(args.log_json);
    }
}
