use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use hoard_index::{
    check_bloom, check_midx, do_midx, list_index_files, midx_dir, ruin_bloom, run_bloom,
    BloomOutcome, BloomRequest, IndexSource, MidxRequest, Report, BLOOM_FILE_NAME,
};
use hoard_pack::{PackSet, PackWriter};
use hoard_split::{join, split_to_blob_or_tree, split_to_blobs, HashSplitter};
use hoard_store::ObjectReader;
use tracing::debug;

use crate::cli::*;
use crate::config::{pack_dir, RepoConfig, CONFIG_FILE_NAME};

/// Run one command. Object ids and payloads go to `out`; progress goes to
/// stdout and the log. Problems that did not stop the command are returned
/// in the report.
pub fn run_command(cli: Cli, out: &mut dyn Write) -> anyhow::Result<Report> {
    let repo = cli.repo;
    let mut report = Report::new();
    match cli.command {
        Command::Init(_) => cmd_init(&repo)?,
        Command::Split(args) => cmd_split(&repo, args, out)?,
        Command::Join(args) => cmd_join(&repo, args, out)?,
        Command::Cat(args) => cmd_cat(&repo, args, out)?,
        Command::ListIdx(args) => cmd_list_idx(args, out, &mut report)?,
        Command::Bloom(args) => cmd_bloom(&repo, args, &mut report)?,
        Command::Midx(args) => cmd_midx(&repo, args, out, &mut report)?,
    }
    out.flush()?;
    Ok(report)
}

fn open_packs(repo: &Path) -> anyhow::Result<PackSet> {
    let dir = pack_dir(repo);
    PackSet::open(&dir).with_context(|| {
        format!("{} is not a hoard repository (try `hoard init`)", repo.display())
    })
}

fn cmd_init(repo: &Path) -> anyhow::Result<()> {
    let dir = pack_dir(repo);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let config_path = repo.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        std::fs::write(&config_path, RepoConfig::default().to_toml()?)
            .with_context(|| format!("writing {}", config_path.display()))?;
    }
    println!(
        "{} Initialized hoard repository in {}",
        "✓".green().bold(),
        repo.display().to_string().bold()
    );
    Ok(())
}

fn cmd_split(repo: &Path, args: SplitArgs, out: &mut dyn Write) -> anyhow::Result<()> {
    let mut config = RepoConfig::load(repo)?;
    if let Some(bits) = args.bits {
        config.split.bits = bits;
    }
    if let Some(fanout) = args.fanout {
        config.split.fanout = fanout;
    }
    config.split.keep_boundaries |= args.keep_boundaries;

    let files = args
        .files
        .iter()
        .map(|p| File::open(p).with_context(|| format!("opening {}", p.display())))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let splitter = HashSplitter::new(files, &config.split)?;
    let mut writer = PackWriter::new(&pack_dir(repo), config.pack, config.maintenance)?;

    let result = if args.blobs {
        split_to_blobs(&mut writer, splitter).try_for_each(|r| -> anyhow::Result<()> {
            let (id, _, _) = r?;
            writeln!(out, "{id}")?;
            Ok(())
        })
    } else {
        split_to_blob_or_tree(&mut writer, splitter, config.split.max_per_tree)
            .map_err(anyhow::Error::from)
            .and_then(|top| {
                debug!(id = %top.id, size = top.size, tree = top.is_tree(), "split");
                writeln!(out, "{}", top.id)?;
                Ok(())
            })
    };
    match result {
        Ok(()) => {
            let idxs = writer.close()?;
            debug!(packs = idxs.len(), "split: packs written");
            Ok(())
        }
        Err(e) => {
            writer.abort();
            Err(e)
        }
    }
}

fn cmd_join(repo: &Path, args: JoinArgs, out: &mut dyn Write) -> anyhow::Result<()> {
    let mut set = open_packs(repo)?;
    let n = join(&mut set, &args.oid, out)?;
    debug!(id = %args.oid, bytes = n, "joined");
    Ok(())
}

fn cmd_cat(repo: &Path, args: CatArgs, out: &mut dyn Write) -> anyhow::Result<()> {
    let mut set = open_packs(repo)?;
    let obj = set.read_required(&args.oid)?;
    out.write_all(&obj.data)?;
    Ok(())
}

fn cmd_list_idx(
    args: ListIdxArgs,
    out: &mut dyn Write,
    report: &mut Report,
) -> anyhow::Result<()> {
    let many = args.files.len() > 1;
    for path in &args.files {
        let src = match IndexSource::open(path) {
            Ok(src) => src,
            Err(e) => {
                report.problem(format!("{}: {e}", path.display()));
                continue;
            }
        };
        for oid in src.iter() {
            let hex = oid.to_hex();
            if args.find.as_deref().is_some_and(|f| !hex.starts_with(f)) {
                continue;
            }
            if many {
                write!(out, "{}: ", path.display())?;
            }
            writeln!(out, "{hex}")?;
        }
    }
    Ok(())
}

fn cmd_bloom(repo: &Path, args: BloomArgs, report: &mut Report) -> anyhow::Result<()> {
    let config = RepoConfig::load(repo)?;
    let dir = args.dir.unwrap_or_else(|| pack_dir(repo));
    let output = args.output.unwrap_or_else(|| dir.join(BLOOM_FILE_NAME));

    if args.ruin {
        ruin_bloom(&output)?;
        println!("{} Ruined {}", "✓".green(), output.display());
        return Ok(());
    }
    if let Some(idx) = &args.check {
        check_bloom(&dir, &output, idx, report)?;
        if report.is_clean() {
            println!("{} Checked {} against {}", "✓".green(), output.display(), idx.display());
        }
        return Ok(());
    }

    let req = BloomRequest {
        output: Some(output),
        force: args.force,
        k: args.k,
    };
    match run_bloom(&dir, &req, &config.maintenance, report)? {
        BloomOutcome::NothingToDo => println!("bloom: nothing to do."),
        BloomOutcome::Created { path, idxs, objects } => println!(
            "{} Created {} ({idxs} idx, {objects} objects)",
            "✓".green(),
            path.display().to_string().bold()
        ),
        BloomOutcome::Updated { path, idxs, objects } => println!(
            "{} Updated {} (+{idxs} idx, +{objects} objects)",
            "✓".green(),
            path.display().to_string().bold()
        ),
    }
    Ok(())
}

fn cmd_midx(
    repo: &Path,
    args: MidxArgs,
    out: &mut dyn Write,
    report: &mut Report,
) -> anyhow::Result<()> {
    let mut config = RepoConfig::load(repo)?;
    if let Some(n) = args.max_files {
        config.maintenance.max_files = n;
        config.maintenance.validate()?;
    }
    let dir = args.dir.unwrap_or_else(|| pack_dir(repo));

    if args.check {
        let names = if args.auto {
            list_index_files(&dir)?.1
        } else {
            args.names
        };
        for path in &names {
            check_midx(path, report)?;
        }
        if report.is_clean() {
            println!("{} {} midx checked", "✓".green(), names.len());
        }
        return Ok(());
    }

    let req = MidxRequest {
        output: args.output,
        auto: args.auto,
        force: args.force,
    };
    let created = if args.auto || args.force {
        midx_dir(&dir, &req, &config.maintenance, report)?
    } else {
        do_midx(&dir, &args.names, &req, report)?
            .map(|summary| summary.path)
            .into_iter()
            .collect()
    };

    for path in &created {
        if args.print {
            writeln!(out, "{}", path.display())?;
        } else {
            println!("{} Created {}", "✓".green(), path.display().to_string().bold());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use hoard_index::PackMidx;

    fn run(repo: &Path, args: &[&str]) -> (Report, Vec<u8>) {
        let cli = Cli::try_parse_from(
            ["hoard", "-C"]
                .into_iter()
                .chain(repo.to_str())
                .chain(args.iter().copied()),
        )
        .unwrap();
        let mut out = Vec::new();
        let report = run_command(cli, &mut out).unwrap();
        (report, out)
    }

    fn pseudo_random(n: usize, mut seed: u32) -> Vec<u8> {
        (0..n)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                seed as u8
            })
            .collect()
    }

    #[test]
    fn init_split_join_cat() {
        let repo = tempfile::tempdir().unwrap();
        run(repo.path(), &["init"]);
        assert!(pack_dir(repo.path()).is_dir());
        assert!(repo.path().join(CONFIG_FILE_NAME).is_file());

        let data = pseudo_random(300_000, 7);
        let file = repo.path().join("input");
        std::fs::write(&file, &data).unwrap();

        let (report, out) = run(repo.path(), &["split", file.to_str().unwrap()]);
        assert!(report.is_clean());
        let top = String::from_utf8(out).unwrap().trim().to_string();
        assert_eq!(top.len(), 40);

        let (_, joined) = run(repo.path(), &["join", &top]);
        assert_eq!(joined, data);

        let (_, blobs) = run(repo.path(), &["split", "--blobs", file.to_str().unwrap()]);
        let blobs = String::from_utf8(blobs).unwrap();
        let first = blobs.lines().next().unwrap();
        let (_, chunk) = run(repo.path(), &["cat", first]);
        assert!(!chunk.is_empty());
        assert!(data.starts_with(&chunk));
    }

    #[test]
    fn split_of_known_content_is_stable() {
        let repo = tempfile::tempdir().unwrap();
        let file = repo.path().join("input");
        std::fs::write(&file, pseudo_random(100_000, 3)).unwrap();
        let (_, a) = run(repo.path(), &["split", file.to_str().unwrap()]);
        let (_, b) = run(repo.path(), &["split", file.to_str().unwrap()]);
        assert_eq!(a, b);
    }

    #[test]
    fn list_idx_filters_by_prefix() {
        let repo = tempfile::tempdir().unwrap();
        let file = repo.path().join("input");
        std::fs::write(&file, pseudo_random(200_000, 11)).unwrap();
        run(repo.path(), &["split", file.to_str().unwrap()]);

        let (idxs, _) = list_index_files(&pack_dir(repo.path())).unwrap();
        let idx = idxs[0].to_str().unwrap();
        let (_, all) = run(repo.path(), &["list-idx", idx]);
        let all = String::from_utf8(all).unwrap();
        let first = all.lines().next().unwrap();

        let (_, found) = run(repo.path(), &["list-idx", "--find", &first[..6], idx]);
        let found = String::from_utf8(found).unwrap();
        assert!(found.lines().any(|l| l == first));
        assert!(found.lines().all(|l| l.starts_with(&first[..6])));
    }

    #[test]
    fn list_idx_reports_unreadable_files() {
        let repo = tempfile::tempdir().unwrap();
        let bogus = repo.path().join("bogus.idx");
        std::fs::write(&bogus, b"not an index").unwrap();
        let (report, out) = run(repo.path(), &["list-idx", bogus.to_str().unwrap()]);
        assert!(!report.is_clean());
        assert!(out.is_empty());
    }

    #[test]
    fn bloom_and_midx_maintenance() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(
            repo.path().join(CONFIG_FILE_NAME),
            "[maintenance]\nauto_after_write = false\n",
        )
        .unwrap();
        for seed in 1..=3 {
            let file = repo.path().join(format!("input{seed}"));
            std::fs::write(&file, pseudo_random(50_000, seed)).unwrap();
            run(repo.path(), &["split", file.to_str().unwrap()]);
        }
        let dir = pack_dir(repo.path());
        let (idxs, midxs) = list_index_files(&dir).unwrap();
        assert_eq!(idxs.len(), 3);
        assert!(midxs.is_empty());

        let (report, _) = run(repo.path(), &["bloom"]);
        assert!(report.is_clean());
        assert!(dir.join(BLOOM_FILE_NAME).is_file());
        let (report, _) = run(repo.path(), &["bloom", "--check", idxs[0].to_str().unwrap()]);
        assert!(report.is_clean());

        let (report, printed) = run(repo.path(), &["midx", "-f", "-p"]);
        assert!(report.is_clean());
        let printed = String::from_utf8(printed).unwrap();
        let midx = Path::new(printed.trim());
        assert_eq!(PackMidx::open(midx).unwrap().idx_names().len(), 3);

        let (report, _) = run(repo.path(), &["midx", "--check", "-a"]);
        assert!(report.is_clean());
        let (report, _) = run(repo.path(), &["midx", "--check", midx.to_str().unwrap()]);
        assert!(report.is_clean());

        let (report, _) = run(repo.path(), &["bloom", "--ruin"]);
        assert!(report.is_clean());
    }
}
