use args::Args;
use getopts::Occur;
use glob::glob;
use malloc_trace::{report, Snapshot};
use num_format::{Locale, ToFormattedString};
use std::fs;

const PROGRAM_DESC: &str = "Visualize malloc_trace call-site profiles";
const PROGRAM_NAME: &str = "mt_print";

fn main() -> Result<(), anyhow::Error> {
    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "d",
        "dir",
        "Directory that stores target snapshots",
        "DIR",
        Occur::Req,
        None,
    );
    args.flag("a", "all", "Print every call site instead of the top 10");

    args.parse_from_cli()?;

    let dir: String = args.value_of("dir")?;
    let all: bool = args.value_of("all")?;
    let wildcard = format!("{}/*.yaml", dir);

    // Aggregate snapshots (one per traced process).
    let mut aggregate = Snapshot::default();

    for path in glob(wildcard.as_str())? {
        let path = path?;
        eprintln!("found snapshot in {}", path.display());
        let snapshot_bytes = fs::read(path)?;
        aggregate.merge(&serde_yaml::from_slice::<Snapshot>(&snapshot_bytes[..])?);
    }

    eprintln!(
        "Aggregate profile: {} call sites, {} invocations, {} lost",
        aggregate.sites.len().to_formatted_string(&Locale::en),
        aggregate.invocations.to_formatted_string(&Locale::en),
        aggregate.lost.to_formatted_string(&Locale::en),
    );

    let mut sites = aggregate.to_sites();
    let mut out = String::new();
    report::write_sites(&mut sites, all, &|frame| aggregate.resolve_symbol(frame), &mut out)?;
    println!("{}", out);

    Ok(())
}
