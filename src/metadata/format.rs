/// Formatting of numeric EXIF values into the display strings stored in
/// the index. The rules are fixed so query output stays stable across
/// re-indexing runs.

/// Exposure time in seconds:
/// `0` → `"0s"`, `t ≥ 1` → `"<t>s"`, otherwise `"1/<round(1/t)>s"`.
pub fn format_exposure(t: f64) -> String {
    if t == 0.0 {
        "0s".to_string()
    } else if t >= 1.0 {
        format!("{}s", trim_number(t))
    } else {
        format!("1/{}s", (1.0 / t).round() as i64)
    }
}

/// Aperture f-number, rounded to one decimal: `"f/2.8"`, `"f/4"`.
pub fn format_aperture(t: f64) -> String {
    format!("f/{}", trim_number((t * 10.0).round() / 10.0))
}

/// Focal length in millimeters, rounded to one decimal: `"35mm"`.
pub fn format_focal_length(t: f64) -> String {
    format!("{}mm", trim_number((t * 10.0).round() / 10.0))
}

/// Render a float the way JSON would: no trailing `.0` on whole numbers.
fn trim_number(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}
