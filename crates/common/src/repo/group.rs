use std::collections::BTreeMap;

use super::mst::Record;

/// Bucket records by collection.
///
/// Collections come back sorted, records keep their input order within a
///  collection, so the archive layout is deterministic.
pub fn group_by_collection<'a, I>(records: I) -> BTreeMap<&'a str, Vec<&'a Record>>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut groups: BTreeMap<&'a str, Vec<&'a Record>> = BTreeMap::new();
    for record in records {
        groups
            .entry(record.collection.as_str())
            .or_default()
            .push(record);
    }
    groups
}

/// Record count per collection
pub fn collection_counts(records: &[Record]) -> BTreeMap<String, usize> {
    group_by_collection(records)
        .into_iter()
        .map(|(collection, items)| (collection.to_string(), items.len()))
        .collect()
}
