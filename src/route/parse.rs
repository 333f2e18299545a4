//! Textual route-update grammar and table builder.
//!
//! Updates arrive as newline-terminated records with `|` separated fields;
//! leading whitespace is ignored and `#` introduces a comment line:
//!
//! ```text
//! newrt|start [| table-id]
//! newrt|end   [| record-count]
//! updatert|start
//! updatert|end | record-count
//! rte | <mtype> | <endpoint-list> [| <sub_id>]
//! mse | <mtype> | <sub_id> | <endpoint-list>
//! del | <mtype> | <sub_id>
//! meid_map | start
//! meid_map | end | record-count
//! mme_ar | <endpoint> | meid1 meid2 ...
//! mme_del | meid1 meid2 ...
//! ```
//!
//! An `endpoint-list` is semicolon-separated groups of comma-separated
//! `host:port` names, or the literal `%meid` to route on the message's
//! managed-element id. A build whose declared record count does not match
//! the number of records actually accepted is discarded whole; the
//! previously active table stays in force.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{RouteEntry, RouteTable, RrGroup};
use crate::error::RmrError;
use crate::msg::UNSET_SUBID;
use crate::session::{Endpoint, EndpointRegistry};

/// Result of feeding one record to the builder.
pub enum RecordOutcome {
    /// Nothing externally visible happened.
    Continue,
    /// A complete table was validated; the caller must install it.
    Installed { table: RouteTable, records: u32 },
    /// A build was discarded; the active table remains in force.
    Rejected { table_id: String, reason: String },
}

enum BuildKind {
    Fresh,
    Update,
}

struct Build {
    table: RouteTable,
    kind: BuildKind,
    accepted: u32,
}

enum MeidOp {
    Add { ep: Arc<Endpoint>, meids: Vec<String> },
    Del { meids: Vec<String> },
}

struct MeidBuild {
    ops: Vec<MeidOp>,
    accepted: u32,
}

/// Incremental builder driven one record at a time by the collector.
#[derive(Default)]
pub struct TableBuilder {
    build: Option<Build>,
    meid: Option<MeidBuild>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a table or MEID section is being assembled.
    pub fn in_progress(&self) -> bool {
        self.build.is_some() || self.meid.is_some()
    }

    /// Parse one record. `active` is the currently installed table (the
    /// base for `updatert` clones and MEID-only updates); `registry`
    /// resolves endpoint names to shared endpoint handles.
    pub fn parse_record(
        &mut self,
        line: &str,
        registry: &EndpointRegistry,
        active: &RouteTable,
    ) -> RecordOutcome {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return RecordOutcome::Continue;
        }

        let toks: Vec<&str> = line.split('|').map(str::trim).collect();
        match toks[0] {
            "newrt" => self.newrt(&toks),
            "updatert" => self.updatert(&toks, active),
            "rte" => self.rte_record(&toks, registry),
            "mse" => self.mse_record(&toks, registry),
            "del" => self.del_record(&toks),
            "meid_map" => self.meid_map(&toks, active),
            "mme_ar" => self.mme_ar(&toks, registry),
            "mme_del" => self.mme_del(&toks),
            other => {
                warn!("route update: unrecognised record type ({})", other);
                RecordOutcome::Continue
            }
        }
    }

    fn newrt(&mut self, toks: &[&str]) -> RecordOutcome {
        match toks.get(1) {
            Some(&"start") => {
                if self.build.is_some() {
                    warn!("new table started before previous build completed; discarding partial table");
                }
                let mut table = RouteTable::new();
                table.table_id = toks.get(2).unwrap_or(&"").to_string();
                self.build = Some(Build { table, kind: BuildKind::Fresh, accepted: 0 });
                RecordOutcome::Continue
            }
            Some(&"end") => self.finish(toks.get(2).copied(), false),
            _ => {
                warn!("route update: malformed newrt record");
                RecordOutcome::Continue
            }
        }
    }

    fn updatert(&mut self, toks: &[&str], active: &RouteTable) -> RecordOutcome {
        match toks.get(1) {
            Some(&"start") => {
                if self.build.is_some() {
                    warn!("table update started before previous build completed; discarding partial table");
                }
                let table = active.clone();
                self.build = Some(Build { table, kind: BuildKind::Update, accepted: 0 });
                RecordOutcome::Continue
            }
            Some(&"end") => self.finish(toks.get(2).copied(), true),
            _ => {
                warn!("route update: malformed updatert record");
                RecordOutcome::Continue
            }
        }
    }

    /// Close the in-progress build, validating the declared record count.
    /// For a fresh table the count is optional (seed files omit it); for an
    /// update it is required.
    fn finish(&mut self, declared: Option<&str>, update: bool) -> RecordOutcome {
        let Some(mut build) = self.build.take() else {
            warn!("route update: end record with no table in progress");
            return RecordOutcome::Continue;
        };

        if update != matches!(build.kind, BuildKind::Update) {
            let table_id = build.table.table_id.clone();
            return RecordOutcome::Rejected {
                table_id,
                reason: "start/end record kinds do not match".to_string(),
            };
        }

        match declared.filter(|d| !d.is_empty()) {
            Some(d) => match d.parse::<u32>() {
                Ok(want) if want == build.accepted => {}
                Ok(want) => {
                    return RecordOutcome::Rejected {
                        table_id: build.table.table_id.clone(),
                        reason: format!("record count mismatch: declared {} accepted {}", want, build.accepted),
                    };
                }
                Err(_) => {
                    return RecordOutcome::Rejected {
                        table_id: build.table.table_id.clone(),
                        reason: format!("unparsable record count ({})", d),
                    };
                }
            },
            None if update => {
                return RecordOutcome::Rejected {
                    table_id: build.table.table_id.clone(),
                    reason: "update end missing record count".to_string(),
                };
            }
            None => {}
        }

        build.table.updates = build.accepted;
        debug!(
            "route table complete: id=({}) records={} entries={}",
            build.table.table_id,
            build.accepted,
            build.table.entry_count()
        );
        RecordOutcome::Installed { records: build.accepted, table: build.table }
    }

    /// Legacy entry record: `rte|mtype|endpoint-list[|sub_id]`.
    fn rte_record(&mut self, toks: &[&str], registry: &EndpointRegistry) -> RecordOutcome {
        let (Some(mtype), Some(eplist)) = (toks.get(1), toks.get(2)) else {
            warn!("route update: short rte record");
            return RecordOutcome::Continue;
        };
        let sub_id = toks.get(3).copied();
        self.add_entry(mtype, sub_id, eplist, registry)
    }

    /// Preferred entry record: `mse|mtype|sub_id|endpoint-list`.
    fn mse_record(&mut self, toks: &[&str], registry: &EndpointRegistry) -> RecordOutcome {
        let (Some(mtype), Some(sub_id), Some(eplist)) = (toks.get(1), toks.get(2), toks.get(3)) else {
            warn!("route update: short mse record");
            return RecordOutcome::Continue;
        };
        self.add_entry(mtype, Some(*sub_id), eplist, registry)
    }

    fn add_entry(
        &mut self,
        mtype: &str,
        sub_id: Option<&str>,
        eplist: &str,
        registry: &EndpointRegistry,
    ) -> RecordOutcome {
        let Some(build) = self.build.as_mut() else {
            warn!("route update: entry record before table start; ignored");
            return RecordOutcome::Continue;
        };

        let Ok(mtype) = mtype.parse::<i32>() else {
            warn!("route update: unparsable message type ({})", mtype);
            return RecordOutcome::Continue;
        };
        let sub_id = match sub_id {
            None => UNSET_SUBID,
            Some(s) => match s.parse::<i32>() {
                Ok(v) => v,
                Err(_) => {
                    warn!("route update: unparsable subscription id ({})", s);
                    return RecordOutcome::Continue;
                }
            },
        };

        if eplist == "%meid" {
            build.table.insert(RouteEntry::new(mtype, sub_id, Vec::new(), true));
            build.accepted += 1;
            return RecordOutcome::Continue;
        }

        let mut groups = Vec::new();
        for group in eplist.split(';') {
            let eps: Vec<Arc<Endpoint>> = group
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(|n| registry.ensure(n))
                .collect();
            if !eps.is_empty() {
                groups.push(RrGroup::new(eps));
            }
        }
        if groups.is_empty() {
            warn!("route update: entry for mtype {} has no usable endpoints", mtype);
            return RecordOutcome::Continue;
        }

        build.table.insert(RouteEntry::new(mtype, sub_id, groups, false));
        build.accepted += 1;
        RecordOutcome::Continue
    }

    /// `del|mtype|sub_id` — remove an entry during an update build.
    fn del_record(&mut self, toks: &[&str]) -> RecordOutcome {
        let Some(build) = self.build.as_mut() else {
            warn!("route update: del record before table start; ignored");
            return RecordOutcome::Continue;
        };
        let (Some(Ok(mtype)), Some(Ok(sub_id))) =
            (toks.get(1).map(|t| t.parse::<i32>()), toks.get(2).map(|t| t.parse::<i32>()))
        else {
            warn!("route update: malformed del record");
            return RecordOutcome::Continue;
        };

        build.table.remove(sub_id, mtype);
        build.accepted += 1;
        RecordOutcome::Continue
    }

    fn meid_map(&mut self, toks: &[&str], active: &RouteTable) -> RecordOutcome {
        match toks.get(1) {
            Some(&"start") => {
                if self.meid.is_some() {
                    warn!("meid map started before previous section completed; discarding");
                }
                self.meid = Some(MeidBuild { ops: Vec::new(), accepted: 0 });
                RecordOutcome::Continue
            }
            Some(&"end") => {
                let Some(meid) = self.meid.take() else {
                    warn!("meid map end with no section in progress");
                    return RecordOutcome::Continue;
                };
                match toks.get(2).and_then(|d| d.parse::<u32>().ok()) {
                    Some(want) if want != meid.accepted => {
                        return RecordOutcome::Rejected {
                            table_id: String::new(),
                            reason: format!(
                                "meid record count mismatch: declared {} accepted {}",
                                want, meid.accepted
                            ),
                        };
                    }
                    _ => {}
                }

                // Apply to the build in progress when there is one; a MEID
                // section arriving on its own becomes an update of the
                // active table.
                if let Some(build) = self.build.as_mut() {
                    apply_meid_ops(&mut build.table, meid.ops);
                    RecordOutcome::Continue
                } else {
                    let mut table = active.clone();
                    apply_meid_ops(&mut table, meid.ops);
                    table.updates += meid.accepted;
                    RecordOutcome::Installed { records: meid.accepted, table }
                }
            }
            _ => {
                warn!("route update: malformed meid_map record");
                RecordOutcome::Continue
            }
        }
    }

    /// `mme_ar|endpoint|meid1 meid2 ...` — add or replace MEID ownership.
    fn mme_ar(&mut self, toks: &[&str], registry: &EndpointRegistry) -> RecordOutcome {
        let Some(meid) = self.meid.as_mut() else {
            warn!("mme_ar outside of a meid_map section; ignored");
            return RecordOutcome::Continue;
        };
        let (Some(ep_name), Some(list)) = (toks.get(1), toks.get(2)) else {
            warn!("route update: short mme_ar record");
            return RecordOutcome::Continue;
        };
        let meids: Vec<String> = list.split_whitespace().map(str::to_string).collect();
        if meids.is_empty() {
            warn!("route update: mme_ar with no meids");
            return RecordOutcome::Continue;
        }
        meid.ops.push(MeidOp::Add { ep: registry.ensure(ep_name), meids });
        meid.accepted += 1;
        RecordOutcome::Continue
    }

    /// `mme_del|meid1 meid2 ...` — drop MEID ownership.
    fn mme_del(&mut self, toks: &[&str]) -> RecordOutcome {
        let Some(meid) = self.meid.as_mut() else {
            warn!("mme_del outside of a meid_map section; ignored");
            return RecordOutcome::Continue;
        };
        let Some(list) = toks.get(1) else {
            warn!("route update: short mme_del record");
            return RecordOutcome::Continue;
        };
        let meids: Vec<String> = list.split_whitespace().map(str::to_string).collect();
        if meids.is_empty() {
            warn!("route update: mme_del with no meids");
            return RecordOutcome::Continue;
        }
        meid.ops.push(MeidOp::Del { meids });
        meid.accepted += 1;
        RecordOutcome::Continue
    }
}

fn apply_meid_ops(table: &mut RouteTable, ops: Vec<MeidOp>) {
    for op in ops {
        match op {
            MeidOp::Add { ep, meids } => {
                for m in meids {
                    table.map_meid(&m, Arc::clone(&ep));
                }
            }
            MeidOp::Del { meids } => {
                for m in meids {
                    table.unmap_meid(&m);
                }
            }
        }
    }
}

/// Reassembly buffer for record streams: route updates may arrive split at
/// arbitrary byte boundaries, so bytes are accumulated and complete
/// newline-terminated records handed out as they form.
#[derive(Default)]
pub struct RecordAssembler {
    partial: Vec<u8>,
}

impl RecordAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every record completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);

        let mut records = Vec::new();
        while let Some(nl) = self.partial.iter().position(|&b| b == b'\n') {
            let rest = self.partial.split_off(nl + 1);
            let mut rec = std::mem::replace(&mut self.partial, rest);
            rec.pop(); // newline
            records.push(String::from_utf8_lossy(&rec).into_owned());
        }
        records
    }
}

/// Read a seed route table from disk. Records are processed exactly as if
/// they had arrived from the route manager; the last complete table in the
/// file wins. Returns `Ok(None)` when the file holds no complete table.
pub fn read_static_table(
    path: &Path,
    registry: &EndpointRegistry,
) -> Result<Option<RouteTable>, RmrError> {
    let text = std::fs::read_to_string(path)?;

    let mut builder = TableBuilder::new();
    let mut installed: Option<RouteTable> = None;
    for line in text.lines() {
        let active = installed.take().unwrap_or_default();
        match builder.parse_record(line, registry, &active) {
            RecordOutcome::Installed { table, records } => {
                info!("seed table loaded from {}: {} records", path.display(), records);
                installed = Some(table);
            }
            RecordOutcome::Rejected { reason, .. } => {
                warn!("seed table record set rejected: {}", reason);
                installed = Some(active);
            }
            RecordOutcome::Continue => {
                installed = Some(active);
            }
        }
    }
    Ok(installed.filter(|t| t.entry_count() > 0 || t.updates > 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(builder: &mut TableBuilder, reg: &EndpointRegistry, active: &RouteTable, text: &str) -> Vec<RecordOutcome> {
        text.lines().map(|l| builder.parse_record(l, reg, active)).collect()
    }

    fn build_table(text: &str) -> (Option<RouteTable>, EndpointRegistry) {
        let reg = EndpointRegistry::new();
        let mut builder = TableBuilder::new();
        let active = RouteTable::new();
        let mut installed = None;
        for outcome in run(&mut builder, &reg, &active, text) {
            if let RecordOutcome::Installed { table, .. } = outcome {
                installed = Some(table);
            }
        }
        (installed, reg)
    }

    #[test]
    fn parses_a_simple_table() {
        let (table, _reg) = build_table(
            "newrt|start|tab001\n\
             # comment line\n\
             mse|1|-1|127.0.0.1:4560\n\
             mse | 2 | 33 | a:1,b:1;c:2\n\
             rte|3|legacy:9\n\
             rte|4|legacy2:9|44\n\
             newrt|end|4\n",
        );
        let table = table.expect("table installs");
        assert_eq!(table.table_id, "tab001");
        assert_eq!(table.updates, 4);
        assert_eq!(
            table.summary(),
            vec![
                ((1, -1), vec![vec!["127.0.0.1:4560".to_string()]]),
                ((2, 33), vec![vec!["a:1".to_string(), "b:1".to_string()], vec!["c:2".to_string()]]),
                ((3, -1), vec![vec!["legacy:9".to_string()]]),
                ((4, 44), vec![vec!["legacy2:9".to_string()]]),
            ]
        );
    }

    #[test]
    fn parsing_twice_yields_identical_tables() {
        let text = "newrt|start\nmse|10|-1|x:1;y:2,z:3\nmse|11|9|w:4\nnewrt|end|2\n";
        let (a, _) = build_table(text);
        let (b, _) = build_table(text);
        assert_eq!(a.unwrap().summary(), b.unwrap().summary());
    }

    #[test]
    fn count_mismatch_discards_the_build() {
        let (table, _reg) = build_table("newrt|start\nmse|1|-1|a:1\nnewrt|end|5\n");
        assert!(table.is_none());
    }

    #[test]
    fn bad_records_are_not_counted() {
        // the unparsable record makes the declared count wrong -> rejected
        let (table, _) = build_table("newrt|start\nmse|1|-1|a:1\nmse|junk|-1|b:1\nnewrt|end|2\n");
        assert!(table.is_none());

        // declared count matching the accepted (good) records installs
        let (table, _) = build_table("newrt|start\nmse|1|-1|a:1\nmse|junk|-1|b:1\nnewrt|end|1\n");
        assert!(table.is_some());
    }

    #[test]
    fn update_clones_and_mutates_the_active_table() {
        let (base, reg) = build_table("newrt|start\nmse|1|-1|a:1\nmse|2|-1|b:1\nnewrt|end|2\n");
        let base = base.unwrap();

        let mut builder = TableBuilder::new();
        let mut updated = None;
        for outcome in run(
            &mut builder,
            &reg,
            &base,
            "updatert|start\nmse|2|-1|c:9\ndel|1|-1\nupdatert|end|2\n",
        ) {
            if let RecordOutcome::Installed { table, .. } = outcome {
                updated = Some(table);
            }
        }
        let updated = updated.expect("update installs");

        assert!(updated.get_rte(-1, 1, false).is_none());
        let (ep, _) = updated.get_rte(-1, 2, false).unwrap().select(0);
        assert_eq!(ep.unwrap().name(), "c:9");
        // the base table is untouched
        assert!(base.get_rte(-1, 1, false).is_some());
        let (ep, _) = base.get_rte(-1, 2, false).unwrap().select(0);
        assert_eq!(ep.unwrap().name(), "b:1");
    }

    #[test]
    fn update_without_count_is_rejected() {
        let (base, reg) = build_table("newrt|start\nmse|1|-1|a:1\nnewrt|end|1\n");
        let base = base.unwrap();

        let mut builder = TableBuilder::new();
        let outcomes = run(&mut builder, &reg, &base, "updatert|start\nmse|1|-1|b:1\nupdatert|end\n");
        assert!(matches!(outcomes.last(), Some(RecordOutcome::Rejected { .. })));
    }

    #[test]
    fn meid_section_routes_and_deletes() {
        let reg = EndpointRegistry::new();
        let mut builder = TableBuilder::new();
        let active = RouteTable::new();

        let mut installed = None;
        for outcome in run(
            &mut builder,
            &reg,
            &active,
            "meid_map|start\nmme_ar|box:9000|meid01 meid02\nmme_ar|other:9000|meid03\nmeid_map|end|2\n",
        ) {
            if let RecordOutcome::Installed { table, .. } = outcome {
                installed = Some(table);
            }
        }
        let table = installed.expect("meid-only update installs");
        assert_eq!(table.meid_endpoint("meid01").unwrap().name(), "box:9000");
        assert_eq!(table.meid_endpoint("meid03").unwrap().name(), "other:9000");

        let mut installed = None;
        for outcome in run(&mut builder, &reg, &table, "meid_map|start\nmme_del|meid01\nmeid_map|end|1\n") {
            if let RecordOutcome::Installed { table, .. } = outcome {
                installed = Some(table);
            }
        }
        let table = installed.unwrap();
        assert!(table.meid_endpoint("meid01").is_none());
        assert!(table.meid_endpoint("meid02").is_some());
    }

    #[test]
    fn meid_route_entries_are_flagged() {
        let (table, _) = build_table("newrt|start\nmse|99|-1|%meid\nnewrt|end|1\n");
        let rte = table.unwrap().get_rte(-1, 99, false).unwrap();
        assert!(rte.route_by_meid);
        assert_eq!(rte.group_count(), 0);
    }

    #[test]
    fn assembler_joins_split_records() {
        let mut asm = RecordAssembler::new();
        assert!(asm.feed(b"mse|1|-1|a").is_empty());
        let recs = asm.feed(b":1\nmse|2|-1|b:1\nmse|3");
        assert_eq!(recs, vec!["mse|1|-1|a:1".to_string(), "mse|2|-1|b:1".to_string()]);
        let recs = asm.feed(b"|-1|c:1\n");
        assert_eq!(recs, vec!["mse|3|-1|c:1".to_string()]);
    }

    #[test]
    fn seed_file_loads() {
        use std::io::Write as _;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "newrt|start\nmse|1|-1|localhost:4560\nnewrt|end\n").unwrap();

        let reg = EndpointRegistry::new();
        let table = read_static_table(f.path(), &reg).unwrap().expect("seed loads");
        assert!(table.get_rte(-1, 1, false).is_some());
    }
}
