/// Odds-format conversions.
///
/// American odds: `+150` pays 150 on a 100 stake, `-110` needs 110 to win 100.
/// Values strictly between -100 and +100 are not valid American prices.

/// Break-even (implied) probability of an American price.
///
///   positive → 100 / (odds + 100)
///   negative → |odds| / (|odds| + 100)
pub fn american_to_implied(odds: f64) -> f64 {
    if odds > 0.0 {
        100.0 / (odds + 100.0)
    } else {
        let a = odds.abs();
        a / (a + 100.0)
    }
}

/// Decimal odds (total return per unit staked, stake included).
pub fn american_to_decimal(odds: f64) -> f64 {
    if odds > 0.0 {
        1.0 + odds / 100.0
    } else {
        1.0 + 100.0 / odds.abs()
    }
}

/// Inverse of [`american_to_implied`]. `p` must lie in (0, 1).
pub fn implied_to_american(p: f64) -> f64 {
    if p >= 0.5 {
        -100.0 * p / (1.0 - p)
    } else {
        100.0 * (1.0 - p) / p
    }
}

pub fn is_valid_american(odds: f64) -> bool {
    odds.is_finite() && odds.abs() >= 100.0
}

/// Remove the bookmaker margin from a two-way market.
///
/// Returns `(home, away)` fair probabilities summing to 1, or `None` when
/// either price is invalid.
pub fn devig(home_odds: f64, away_odds: f64) -> Option<(f64, f64)> {
    if !is_valid_american(home_odds) || !is_valid_american(away_odds) {
        return None;
    }
    let h = american_to_implied(home_odds);
    let a = american_to_implied(away_odds);
    let book = h + a;
    if book <= 0.0 {
        return None;
    }
    Some((h / book, a / book))
}
