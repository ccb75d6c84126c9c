use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Semantic search over your Firefox bookmarks", long_about = None)]
pub struct Args {
    /// Use this profile directory or places.sqlite instead of discovery
    #[clap(long, global = true)]
    pub places: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Bring the index up to date with the bookmark database
    Index {
        /// Discard the persisted index and embed every bookmark again
        #[clap(long, default_value = "false")]
        rebuild: bool,
    },

    /// Find bookmarks whose titles are closest in meaning to QUERY
    Search {
        query: String,

        /// Number of results [default: top_k from config]
        #[clap(short, long)]
        k: Option<usize>,

        /// Print results as JSON
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Show index state and the last refresh
    Status {},

    /// Serve the web UI
    Serve {
        /// Address to listen on [default: listen_addr from config]
        #[clap(long)]
        addr: Option<String>,
    },

    /// Print the bookmark database that would be indexed
    Profile {},
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search() {
        let args = Args::parse_from(["marksearch", "search", "rust books", "-k", "3", "--json"]);
        match args.command {
            Command::Search { query, k, json } => {
                assert_eq!(query, "rust books");
                assert_eq!(k, Some(3));
                assert!(json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_places_is_global() {
        let args = Args::parse_from(["marksearch", "index", "--rebuild", "--places", "/p"]);
        assert_eq!(args.places, Some(PathBuf::from("/p")));
        assert!(matches!(args.command, Command::Index { rebuild: true }));
    }
}
