/// Linear interpolation of `y` at `x` on the segment `(x0, y0)`–`(x1, y1)`,
/// rounded to the nearest integer. `x` must lie within `x0..=x1`.
pub fn interpolate(x0: u32, x1: u32, y0: u32, y1: u32, x: u32) -> u32 {
    if x1 == x0 {
        return y0;
    }

    let span = (x1 - x0) as u64;
    let offset = (x - x0) as u64;

    if y0 > y1 {
        let delta = (offset * (y0 - y1) as u64 + span / 2) / span;
        y0 - delta as u32
    } else {
        let delta = (offset * (y1 - y0) as u64 + span / 2) / span;
        y0 + delta as u32
    }
}
