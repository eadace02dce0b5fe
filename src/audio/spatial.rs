//! Distance attenuation and stereo panning curves
//!
//! Attenuation is piecewise linear in dB over the normalised distance
//! `d_norm = clamp(distance / max_distance, 0, 1)`:
//!
//! | zone         | d_norm    | dB          |
//! |--------------|-----------|-------------|
//! | conversation | 0.0 - 0.2 | 0 -> -3     |
//! | near         | 0.2 - 0.5 | -3 -> -9    |
//! | mid          | 0.5 - 0.8 | -9 -> -21   |
//! | far          | 0.8 - 1.0 | -21 -> -50  |

/// Attenuation at full proximity range, in dB
pub const FULL_ATTENUATION_DB: f32 = -50.0;

/// Zone breakpoints as (d_norm, dB) pairs
const ZONES: [(f32, f32); 5] = [
    (0.0, 0.0),
    (0.2, -3.0),
    (0.5, -9.0),
    (0.8, -21.0),
    (1.0, FULL_ATTENUATION_DB),
];

fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Normalise a distance against the proximity range
pub fn normalized_distance(distance: f32, max_distance: f32) -> f32 {
    if max_distance <= 0.0 {
        return 1.0;
    }
    (distance / max_distance).clamp(0.0, 1.0)
}

/// Attenuation in dB for a normalised distance
pub fn attenuation_db(d_norm: f32) -> f32 {
    let d = d_norm.clamp(0.0, 1.0);
    for pair in ZONES.windows(2) {
        let (d0, db0) = pair[0];
        let (d1, db1) = pair[1];
        if d <= d1 {
            let t = (d - d0) / (d1 - d0);
            return db0 + (db1 - db0) * t;
        }
    }
    FULL_ATTENUATION_DB
}

/// Linear gain derived from distance alone
pub fn distance_gain(distance: f32, max_distance: f32) -> f32 {
    db_to_linear(attenuation_db(normalized_distance(distance, max_distance)))
}

/// Final per-peer gain: distance gain scaled by the peer's UI volume and
/// the master output, zeroed when muted, clamped to [0, 1].
pub fn final_gain(
    distance: f32,
    max_distance: f32,
    ui_volume: f32,
    master_out: f32,
    muted: bool,
) -> f32 {
    if muted {
        return 0.0;
    }
    (distance_gain(distance, max_distance) * ui_volume * master_out).clamp(0.0, 1.0)
}

/// Stereo pan from the horizontal offset: `sign(delta_x) * d_norm^3`
pub fn pan(delta_x: f32, distance: f32, max_distance: f32) -> f32 {
    if delta_x == 0.0 {
        return 0.0;
    }
    let d = normalized_distance(distance, max_distance);
    (delta_x.signum() * d * d * d).clamp(-1.0, 1.0)
}
