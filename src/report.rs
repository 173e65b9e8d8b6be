//! Human-readable reports over the site table.
//!
//! The output format is a de facto contract: tooling parses the literal
//! stats labels and the `Invocs:` / `Alloc Size` lines, so changes here are
//! breaking.

use std::fmt::{self, Write};
use std::path::Path;

use backtrace::SymbolName;
use libc::c_void;

use crate::table::{Site, SiteTable, MAX_ENTRIES, TABLE_SIZE};

/// Number of sites printed in abridged mode.
pub const TOP_SITES: usize = 10;

/// Writes the table-level statistics line.
pub fn write_stats<W: Write>(table: &SiteTable, f: &mut W) -> fmt::Result {
    writeln!(
        f,
        "Table size: {}, num_entries: {} (max: {}), used slots: {}, longest chain: {}",
        TABLE_SIZE,
        table.size(),
        MAX_ENTRIES,
        table.used_slots(),
        table.longest_chain(),
    )?;
    writeln!(
        f,
        "invocs: {}, lost: {}, collisions: {}",
        table.invocations(),
        table.lost(),
        table.collisions(),
    )
}

/// Copies out the sites worth printing.  Called with the trace lock held;
/// the copy is what lets the sort below run without touching the table.
pub fn collect_sites(table: &SiteTable) -> Vec<Site> {
    table
        .sites()
        .filter(|site| site.invocations() > 0)
        .copied()
        .collect()
}

/// Writes the ranked site listing: all sites, or the hottest [`TOP_SITES`]
/// with a footer counting the omitted rest.
///
/// Sites with equal invocation counts keep their relative order (stable
/// sort); that order is not otherwise specified.
pub fn write_sites<W: Write>(
    sites: &mut Vec<Site>,
    all: bool,
    resolve: &dyn Fn(usize) -> String,
    f: &mut W,
) -> fmt::Result {
    if sites.is_empty() {
        return writeln!(f, "Table is empty.");
    }
    sites.sort_by(|a, b| b.invocations().cmp(&a.invocations()));
    let printed = if all {
        sites.len()
    } else {
        TOP_SITES.min(sites.len())
    };
    for (rank, site) in sites[..printed].iter().enumerate() {
        writeln!(f, "#{}:", rank + 1)?;
        writeln!(
            f,
            "  Invocs: {} (+{})",
            site.invocations(),
            site.invocations_delta()
        )?;
        if site.min_size() == site.max_size() {
            writeln!(f, "  Alloc Size: {}", site.min_size())?;
        } else {
            writeln!(
                f,
                "  Alloc Size Range: {} - {}",
                site.min_size(),
                site.max_size()
            )?;
        }
        for frame in site.stack().frames() {
            writeln!(f, "  {}", resolve(*frame))?;
        }
    }
    if printed < sites.len() {
        writeln!(f, "{} entries omitted.", sites.len() - printed)?;
    }
    Ok(())
}

/// Converts a frame address into a human-readable symbol.
///
/// Must run in the process that captured the stack; falls back to the raw
/// address when the symbol cannot be resolved.
pub fn resolve_symbol(frame: usize) -> String {
    let mut sym = format!("{:#x}", frame);
    backtrace::resolve(frame as *mut c_void, |s| {
        sym = format!(
            "{} (in {},{}:{})",
            s.name().unwrap_or_else(|| SymbolName::new(&[])),
            s.filename().unwrap_or_else(|| Path::new("")).display(),
            s.lineno().unwrap_or(0),
            s.colno().unwrap_or(0)
        )
    });
    sym
}

/// Stats dump for the fatal-error path.
///
/// Deliberately takes no lock: the path must remain usable when the lock is
/// held by a thread that has crashed.  The numbers may be mid-update.
pub(crate) fn print_error_report() {
    if let Some(tracer) = unsafe { crate::tracer_unlocked() } {
        let mut out = String::new();
        let _ = write_stats(tracer.table(), &mut out);
        let _ = writeln!(
            out,
            "captures: {} (without stack: {})",
            tracer.captures(),
            tracer.captures_without_stack()
        );
        eprint!("{}", out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::CallStack;

    fn raw(frame: usize) -> String {
        format!("{:#x}", frame)
    }

    fn populate(table: &mut SiteTable, distinct: usize, invocs_each: usize) {
        for i in 0..distinct {
            let stack = CallStack::from_frames(&[i + 1, 1000 + i, 2000 + i]);
            for _ in 0..invocs_each {
                table.add_site(&stack, 64);
            }
        }
    }

    #[test]
    fn stats_line_carries_all_labels() {
        let mut table = SiteTable::new();
        populate(&mut table, 3, 2);
        let mut out = String::new();
        write_stats(&table, &mut out).unwrap();
        for label in &[
            "Table size:",
            "num_entries:",
            "used slots:",
            "longest chain:",
            "invocs:",
            "lost:",
            "collisions:",
        ] {
            assert!(out.contains(label), "missing {:?} in {:?}", label, out);
        }
        assert!(out.contains("Table size: 8171"));
        assert!(out.contains("invocs: 6"));
    }

    #[test]
    fn empty_table_prints_literal_marker() {
        let table = SiteTable::new();
        let mut sites = collect_sites(&table);
        let mut out = String::new();
        write_sites(&mut sites, false, &raw, &mut out).unwrap();
        assert!(out.contains("Table is empty."));
        assert!(!out.contains("#1:"));
    }

    #[test]
    fn few_sites_print_without_omitted_footer() {
        let mut table = SiteTable::new();
        populate(&mut table, 4, 1);
        let mut sites = collect_sites(&table);
        let mut out = String::new();
        write_sites(&mut sites, false, &raw, &mut out).unwrap();
        assert!(out.contains("#1:"));
        assert!(out.contains("#4:"));
        assert!(!out.contains("#5:"));
        assert!(!out.contains("omitted"));
    }

    #[test]
    fn many_sites_print_top_ten_plus_footer() {
        let mut table = SiteTable::new();
        populate(&mut table, 13, 1);
        let mut sites = collect_sites(&table);
        let mut out = String::new();
        write_sites(&mut sites, false, &raw, &mut out).unwrap();
        assert!(out.contains("#10:"));
        assert!(!out.contains("#11:"));
        assert!(out.contains("3 entries omitted."));

        // Full mode prints everything and no footer.
        let mut sites = collect_sites(&table);
        let mut out = String::new();
        write_sites(&mut sites, true, &raw, &mut out).unwrap();
        assert!(out.contains("#13:"));
        assert!(!out.contains("omitted"));
    }

    #[test]
    fn sites_rank_by_descending_invocations() {
        let mut table = SiteTable::new();
        let cold = CallStack::from_frames(&[1, 2]);
        let hot = CallStack::from_frames(&[3, 4]);
        table.add_site(&cold, 8);
        for _ in 0..5 {
            table.add_site(&hot, 16);
        }
        let mut sites = collect_sites(&table);
        let mut out = String::new();
        write_sites(&mut sites, false, &raw, &mut out).unwrap();
        let hot_pos = out.find("Invocs: 5 (+5)").unwrap();
        let cold_pos = out.find("Invocs: 1 (+1)").unwrap();
        assert!(hot_pos < cold_pos);
    }

    #[test]
    fn size_line_collapses_when_range_is_single() {
        let mut table = SiteTable::new();
        let single = CallStack::from_frames(&[1, 2]);
        let ranged = CallStack::from_frames(&[3, 4]);
        table.add_site(&single, 128);
        table.add_site(&single, 128);
        table.add_site(&ranged, 16);
        table.add_site(&ranged, 512);
        let mut sites = collect_sites(&table);
        let mut out = String::new();
        write_sites(&mut sites, false, &raw, &mut out).unwrap();
        assert!(out.contains("Alloc Size: 128"));
        assert!(out.contains("Alloc Size Range: 16 - 512"));
    }

    #[test]
    fn frames_print_one_per_line() {
        let mut table = SiteTable::new();
        table.add_site(&CallStack::from_frames(&[0x10, 0x20]), 8);
        let mut sites = collect_sites(&table);
        let mut out = String::new();
        write_sites(&mut sites, false, &raw, &mut out).unwrap();
        assert!(out.contains("  0x10\n"));
        assert!(out.contains("  0x20\n"));
    }
}
