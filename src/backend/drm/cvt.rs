//! Synthesized "reduced blanking" CVT modelines, for connectors that report
//! no native mode list and need a mode computed from a requested size and
//! refresh rate (`Output::set_custom_mode`).
//!
//! Grounded on wlroots' `cvt.c`, a VESA CVT reduced-blanking (RBv1) timing
//! generator; ported to Rust against the same constants. Timings are an
//! approximation of the VESA spec, not a byte-for-byte reimplementation.

use drm::control::Mode;

const CELL_GRAN: u32 = 8;
const MIN_V_PORCH: u32 = 3;
const MIN_V_BPORCH: u32 = 6;
const V_SYNC_WIDTH: u32 = 4;
const H_SYNC: u32 = 32;
const H_BLANK: u32 = 160;
const MIN_VSYNC_BP_US: f64 = 460.0;
const CLOCK_STEP_MHZ: f64 = 0.25;

/// Compute a CVT reduced-blanking modeline for `width x height` at `hz` Hz.
pub fn reduced_blanking_mode(width: u32, height: u32, hz: u32) -> Mode {
    let h_display = width.div_ceil(CELL_GRAN) * CELL_GRAN;
    let v_display = height;
    let hz = hz.max(1);

    let h_period_est = (1_000_000.0 / hz as f64 - MIN_VSYNC_BP_US) / v_display as f64;
    let vbi_lines = (MIN_VSYNC_BP_US / h_period_est).ceil() as u32 + 1;
    let v_blank = (MIN_V_BPORCH + MIN_V_PORCH).max(vbi_lines);
    let v_total = v_display + v_blank;

    let h_total = h_display + H_BLANK;

    let pixel_clock_mhz = h_total as f64 * v_total as f64 * hz as f64 / 1_000_000.0;
    let clock_khz = ((pixel_clock_mhz / CLOCK_STEP_MHZ).ceil() * CLOCK_STEP_MHZ * 1000.0) as u32;

    let mut name = [0i8; 32];
    for (i, b) in format!("{width}x{height}").bytes().take(31).enumerate() {
        name[i] = b as i8;
    }

    let raw = drm_ffi::drm_mode_modeinfo {
        clock: clock_khz,
        hdisplay: h_display as u16,
        hsync_start: (h_display + H_BLANK / 2 - H_SYNC / 2) as u16,
        hsync_end: (h_display + H_BLANK / 2 + H_SYNC / 2) as u16,
        htotal: h_total as u16,
        hskew: 0,
        vdisplay: v_display as u16,
        vsync_start: (v_display + MIN_V_PORCH) as u16,
        vsync_end: (v_display + MIN_V_PORCH + V_SYNC_WIDTH) as u16,
        vtotal: v_total as u16,
        vscan: 0,
        vrefresh: hz,
        flags: 0,
        type_: 0,
        name,
    };

    Mode::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_plausible_1080p60_timing() {
        let mode = reduced_blanking_mode(1920, 1080, 60);
        assert_eq!(mode.size(), (1920, 1080));
        assert_eq!(mode.vrefresh(), 60);
    }

    #[test]
    fn rounds_width_up_to_cell_granularity() {
        let mode = reduced_blanking_mode(1917, 1080, 60);
        assert_eq!(mode.size().0, 1920);
    }
}
