/// A play reduced to what session detection needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedPlay {
    pub started_at_ms: i64,
    pub duration_ms: u64,
}

/// Length in milliseconds of the longest listening session.
///
/// A session is a maximal run of plays where each play starts no later than
/// `idle_threshold_ms` after the previous play ended. Its length spans from
/// the first play's start to the latest end within the run.
pub fn longest_session_ms(plays: &[TimedPlay], idle_threshold_ms: u64) -> u64 {
    let mut sorted = plays.to_vec();
    sorted.sort_by_key(|p| (p.started_at_ms, p.duration_ms));

    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return 0;
    };

    let end_of = |p: &TimedPlay| p.started_at_ms.saturating_add(p.duration_ms as i64);
    let mut session_start = first.started_at_ms;
    let mut session_end = end_of(&first);
    let mut longest = (session_end - session_start) as u64;

    for play in iter {
        let gap = play.started_at_ms - session_end;
        if gap > idle_threshold_ms as i64 {
            session_start = play.started_at_ms;
            session_end = end_of(&play);
        } else {
            session_end = session_end.max(end_of(&play));
        }
        longest = longest.max((session_end - session_start) as u64);
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    fn at(minute: i64, length_min: u64) -> TimedPlay {
        TimedPlay {
            started_at_ms: minute * MIN,
            duration_ms: length_min * MIN as u64,
        }
    }

    #[test]
    fn empty_has_no_session() {
        assert_eq!(longest_session_ms(&[], 0), 0);
    }

    #[test]
    fn single_play_is_its_own_length() {
        assert_eq!(longest_session_ms(&[at(0, 3)], 0), 3 * MIN as u64);
    }

    #[test]
    fn back_to_back_plays_chain() {
        let plays = [at(0, 3), at(3, 3), at(7, 3)];
        // 1 minute gap fits inside a 2 minute threshold
        assert_eq!(longest_session_ms(&plays, 2 * MIN as u64), 10 * MIN as u64);
        // but not inside a 30 second one
        assert_eq!(longest_session_ms(&plays, 30_000), 6 * MIN as u64);
    }

    #[test]
    fn longest_of_several_sessions() {
        let plays = [at(100, 4), at(0, 2), at(104, 4), at(2, 2), at(108, 4)];
        assert_eq!(longest_session_ms(&plays, 0), 12 * MIN as u64);
    }

    #[test]
    fn overlapping_plays_extend_to_latest_end() {
        let plays = [at(0, 10), at(2, 1)];
        assert_eq!(longest_session_ms(&plays, 0), 10 * MIN as u64);
    }
}
