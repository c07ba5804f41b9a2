// Column naming and ordering for aggregated tables.
//
// A raw metric file `<stem>.csv` with a single `Value` column contributes a column named `<stem>`;
// a file with several columns contributes `<stem>_<column>` for each.  Aggregated columns are then
// ordered process metrics first, GPU metrics by ascending GPU index, and everything else last.
// Within a group the columns keep the order in which they were merged, so a GPU's columns stay in
// file order.

use std::cmp::Ordering;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnKey {
    /// proc_cpu_util, proc_mem_rss
    Process(String),
    /// gpu<index>_<metric>
    Gpu { index: u32, name: String },
    Other(String),
}

impl ColumnKey {
    pub fn parse(column: &str) -> ColumnKey {
        if column.starts_with("proc_") {
            return ColumnKey::Process(column.to_string());
        }
        if let Some(rest) = column.strip_prefix("gpu") {
            let digits = rest
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>();
            if let Ok(index) = digits.parse::<u32>() {
                return ColumnKey::Gpu {
                    index,
                    name: column.to_string(),
                };
            }
        }
        ColumnKey::Other(column.to_string())
    }

    pub fn name(&self) -> &str {
        match self {
            ColumnKey::Process(name) | ColumnKey::Other(name) => name,
            ColumnKey::Gpu { name, .. } => name,
        }
    }

    pub fn gpu_index(&self) -> Option<u32> {
        match self {
            ColumnKey::Gpu { index, .. } => Some(*index),
            _ => None,
        }
    }

    // Group and GPU index.  Deliberately ignores the name.
    fn group(&self) -> (u8, u32) {
        match self {
            ColumnKey::Process(_) => (0, 0),
            ColumnKey::Gpu { index, .. } => (1, *index),
            ColumnKey::Other(_) => (2, 0),
        }
    }

    /// Compare by group only; equal keys keep their relative order under a stable sort.

    pub fn group_cmp(&self, other: &ColumnKey) -> Ordering {
        self.group().cmp(&other.group())
    }
}

/// The aggregated name of `column` from the raw file with stem `stem`.

pub fn source_column_name(stem: &str, column: &str) -> String {
    if column == "Value" {
        stem.to_string()
    } else {
        format!("{stem}_{column}")
    }
}

/// Return the permutation of `columns` that puts them in output order.

pub fn order_columns(columns: &[String]) -> Vec<usize> {
    let keys = columns.iter().map(|c| ColumnKey::parse(c)).collect::<Vec<ColumnKey>>();
    let mut order = (0..columns.len()).collect::<Vec<usize>>();
    order.sort_by(|a, b| keys[*a].group_cmp(&keys[*b]));
    order
}

#[test]
fn test_source_column_name() {
    assert!(source_column_name("proc_cpu_util", "Value") == "proc_cpu_util");
    assert!(source_column_name("gpu0", "Memory(MiB)") == "gpu0_Memory(MiB)");
}

#[test]
fn test_column_key() {
    assert!(ColumnKey::parse("proc_mem_rss") == ColumnKey::Process("proc_mem_rss".to_string()));
    assert!(ColumnKey::parse("gpu12_Util(%)").gpu_index() == Some(12));
    assert!(ColumnKey::parse("gpux_Util(%)") == ColumnKey::Other("gpux_Util(%)".to_string()));
    assert!(ColumnKey::parse("system_memory").gpu_index().is_none());
}

#[test]
fn test_order_columns() {
    let cols = [
        "gpu1_Memory(MiB)",
        "gpu1_Util(%)",
        "extra",
        "gpu0_Memory(MiB)",
        "proc_mem_rss",
        "gpu0_Util(%)",
        "gpu10_Memory(MiB)",
        "proc_cpu_util",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect::<Vec<String>>();
    let ordered = order_columns(&cols)
        .into_iter()
        .map(|i| cols[i].as_str())
        .collect::<Vec<&str>>();
    assert!(
        ordered
            == vec![
                "proc_mem_rss",
                "proc_cpu_util",
                "gpu0_Memory(MiB)",
                "gpu0_Util(%)",
                "gpu1_Memory(MiB)",
                "gpu1_Util(%)",
                "gpu10_Memory(MiB)",
                "extra",
            ]
    );
}
