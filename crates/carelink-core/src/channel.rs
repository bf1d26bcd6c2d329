/// Channel name used when all participants publish to one shared topic.
pub const DEFAULT_SHARED_CHANNEL: &str = "global_messages";

/// Derive the per-pair channel for two participants.
///
/// Both sides must compute the same name, so the ids are put in a
/// canonical order first: numeric when both parse as integers (ids are
/// numeric in practice), lexicographic otherwise.
pub fn direct_channel(a: &str, b: &str) -> String {
    let (lo, hi) = match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) if x > y => (b, a),
        (Ok(_), Ok(_)) => (a, b),
        _ if a <= b => (a, b),
        _ => (b, a),
    };
    format!("dm_{lo}_{hi}")
}
