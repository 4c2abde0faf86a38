use std::cmp::Ordering;

/// Something that can appear in a ranked list of artists, tracks or users.
pub trait Rankable {
    fn plays(&self) -> u32;
    fn duration_ms(&self) -> u64;
    /// Position at which the item was first encountered in the input.
    fn first_seen(&self) -> u64;
}

/// Play count descending, then listening time descending, then first seen.
pub fn rank_order<T: Rankable>(a: &T, b: &T) -> Ordering {
    b.plays()
        .cmp(&a.plays())
        .then_with(|| b.duration_ms().cmp(&a.duration_ms()))
        .then_with(|| a.first_seen().cmp(&b.first_seen()))
}

/// Sorts `items` into rank order and keeps the first `limit`.
pub fn rank_top<T: Rankable>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    items.sort_by(rank_order);
    items.truncate(limit);
    items
}
