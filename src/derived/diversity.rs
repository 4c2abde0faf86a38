/// Distinct tracks over total plays, in `[0, 1]`; 0 when there are no plays.
pub fn listening_diversity(unique_tracks: usize, total_plays: usize) -> f64 {
    if total_plays == 0 {
        return 0.0;
    }
    (unique_tracks.min(total_plays) as f64) / (total_plays as f64)
}
