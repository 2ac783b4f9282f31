use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use hoard_index::config::MIN_MAX_FILES;
use hoard_types::Oid;

#[derive(Parser, Debug)]
#[command(
    name = "hoard",
    about = "hoard: deduplicating content-addressed backup store",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Repository directory
    #[arg(short = 'C', long = "repo", global = true, env = "HOARD_DIR", default_value = ".")]
    pub repo: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the repository layout and a default hoard.toml
    Init(InitArgs),
    /// Split files into content-defined chunks and store them
    Split(SplitArgs),
    /// Reassemble the bytes behind an object id
    Join(JoinArgs),
    /// Print a single object's payload
    Cat(CatArgs),
    /// List the object ids in idx or midx files
    ListIdx(ListIdxArgs),
    /// Create, update, check, or ruin the bloom filter
    Bloom(BloomArgs),
    /// Merge pack indexes into multi-pack indexes
    Midx(MidxArgs),
}

#[derive(Args, Debug)]
pub struct InitArgs {}

#[derive(Args, Debug)]
pub struct SplitArgs {
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
    /// Checksum bits that end a chunk (overrides hoard.toml)
    #[arg(long)]
    pub bits: Option<u32>,
    #[arg(long)]
    pub fanout: Option<u32>,
    /// Never let a chunk span two files
    #[arg(long)]
    pub keep_boundaries: bool,
    /// Print every blob id instead of the top-level id
    #[arg(long)]
    pub blobs: bool,
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    #[arg(value_parser = parse_oid)]
    pub oid: Oid,
}

#[derive(Args, Debug)]
pub struct CatArgs {
    #[arg(value_parser = parse_oid)]
    pub oid: Oid,
}

#[derive(Args, Debug)]
pub struct ListIdxArgs {
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
    /// Only list ids starting with this hex prefix
    #[arg(long, value_parser = parse_hex_prefix)]
    pub find: Option<String>,
}

#[derive(Args, Debug)]
pub struct BloomArgs {
    /// Make the filter useless without invalidating it
    #[arg(long, conflicts_with_all = ["force", "check"])]
    pub ruin: bool,
    /// Rebuild from scratch
    #[arg(short, long)]
    pub force: bool,
    /// Check the filter against one idx
    #[arg(long, value_name = "IDX")]
    pub check: Option<PathBuf>,
    /// Hash functions per object
    #[arg(short, value_parser = clap::value_parser!(u32).range(4..=5))]
    pub k: Option<u32>,
    /// Filter file [default: DIR/hoard.bloom]
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Pack directory [default: REPO/objects/pack]
    #[arg(short, long)]
    pub dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct MidxArgs {
    /// Idx or midx files to merge
    #[arg(
        conflicts_with_all = ["auto", "force"],
        required_unless_present_any = ["auto", "force"]
    )]
    pub names: Vec<PathBuf>,
    /// Merge only when it pays off; with --check, check every midx
    #[arg(short, long, conflicts_with = "force")]
    pub auto: bool,
    /// Merge every index into one midx
    #[arg(short, long)]
    pub force: bool,
    /// Check midx files for consistency
    #[arg(long, conflicts_with_all = ["force", "print", "output", "max_files"])]
    pub check: bool,
    /// Print the names of created midx files
    #[arg(short, long)]
    pub print: bool,
    /// Open at most this many files at once (overrides hoard.toml)
    #[arg(long, value_parser = parse_max_files)]
    pub max_files: Option<usize>,
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Pack directory [default: REPO/objects/pack]
    #[arg(short, long)]
    pub dir: Option<PathBuf>,
}

fn parse_hex_prefix(s: &str) -> Result<String, String> {
    if s.len() > 40 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("not a hex prefix: {s}"));
    }
    Ok(s.to_ascii_lowercase())
}

fn parse_max_files(s: &str) -> Result<usize, String> {
    let n: usize = s.parse().map_err(|e| format!("{s}: {e}"))?;
    if n < MIN_MAX_FILES {
        return Err(format!("must be at least {MIN_MAX_FILES}"));
    }
    Ok(n)
}

fn parse_oid(s: &str) -> Result<Oid, String> {
    Oid::from_hex(s).map_err(|e| format!("bad object id {s}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("hoard").chain(args.iter().copied()))
    }

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn split_with_overrides() {
        let cli = parse(&["-C", "/r", "split", "--bits", "14", "--blobs", "a", "b"]).unwrap();
        assert_eq!(cli.repo, PathBuf::from("/r"));
        let Command::Split(args) = cli.command else {
            panic!("expected split");
        };
        assert_eq!(args.bits, Some(14));
        assert!(args.blobs);
        assert_eq!(args.files.len(), 2);
    }

    #[test]
    fn split_needs_files() {
        assert!(parse(&["split"]).is_err());
    }

    #[test]
    fn bloom_k_range() {
        assert!(parse(&["bloom", "-k", "5"]).is_ok());
        let err = parse(&["bloom", "-k", "3"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(parse(&["bloom", "--ruin", "--force"]).is_err());
    }

    #[test]
    fn midx_flags() {
        let cli = parse(&["midx", "-a", "-p", "--max-files", "20", "-d", "packs"]).unwrap();
        let Command::Midx(args) = cli.command else {
            panic!("expected midx");
        };
        assert!(args.auto && args.print && !args.force);
        assert_eq!(args.max_files, Some(20));
        assert_eq!(args.dir, Some(PathBuf::from("packs")));
        assert!(parse(&["midx", "-a", "-f"]).is_err());
        assert!(parse(&["midx", "--check", "-f"]).is_err());
    }

    #[test]
    fn midx_names_exclude_directory_passes() {
        let inputs = parse(&["midx", "a.idx", "b.idx"]).unwrap();
        let Command::Midx(args) = inputs.command else {
            panic!("expected midx");
        };
        assert_eq!(args.names.len(), 2);

        for argv in [
            &["midx", "-a", "a.idx"][..],
            &["midx", "-f", "a.idx"],
            &["midx"],
            &["midx", "-p"],
        ] {
            let err = parse(argv).unwrap_err();
            assert_eq!(err.exit_code(), 2, "{argv:?}");
        }
    }

    #[test]
    fn midx_check_needs_names_or_auto() {
        assert!(parse(&["midx", "--check", "m.midx"]).is_ok());
        let Command::Midx(args) = parse(&["midx", "--check", "-a"]).unwrap().command else {
            panic!("expected midx");
        };
        assert!(args.check && args.auto);
        let err = parse(&["midx", "--check"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn midx_max_files_floor() {
        assert!(parse(&["midx", "-a", "--max-files", "5"]).is_ok());
        for bad in ["4", "0", "many"] {
            let err = parse(&["midx", "-a", "--max-files", bad]).unwrap_err();
            assert_eq!(err.exit_code(), 2, "{bad}");
        }
    }

    #[test]
    fn oid_arguments_are_checked() {
        let hex = "0123456789abcdef0123456789ABCDEF01234567";
        let Command::Join(args) = parse(&["join", hex]).unwrap().command else {
            panic!("expected join");
        };
        assert_eq!(args.oid.to_hex(), hex.to_ascii_lowercase());
        assert!(parse(&["cat", "abc"]).is_err());
        assert!(parse(&["list-idx", "--find", "xyz", "a.idx"]).is_err());
        assert!(parse(&["list-idx", "--find", "AB", "a.idx"]).is_ok());
    }
}
