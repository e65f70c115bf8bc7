use anyhow::{Context, Result};

/// Multiplier to expand hex color shorthand (e.g., F -> FF)
const HEX_SHORTHAND_MULTIPLIER: u8 = 17;

/// Largest 8-bit channel value, the denominator of the working range
pub const CHANNEL_MAX: f32 = 255.0;

/// RGB color represented as [R, G, B] with values 0-255
pub type Color = [u8; 3];

/// Normalized RGB color with values 0.0-1.0
pub type NormalizedColor = [f32; 3];

/// How a reference color is chosen on the command line
#[derive(Debug, Clone, PartialEq)]
pub enum ColorSpec {
    /// An explicit color
    Hex(Color),
    /// Sample the input image at (x, y)
    Pixel(u32, u32),
    /// Detect the color from the image edges
    Auto,
}

/// Parse a hex color string into RGB
/// Supports: "#ff0000", "ff0000", "#f00", "f00"
pub fn parse_hex_color(hex: &str) -> Result<Color> {
    let hex = hex.trim_start_matches('#');

    let (r, g, b) = match hex.len() {
        3 => {
            let r = u8::from_str_radix(&hex[0..1], 16).context("Invalid red component")?;
            let g = u8::from_str_radix(&hex[1..2], 16).context("Invalid green component")?;
            let b = u8::from_str_radix(&hex[2..3], 16).context("Invalid blue component")?;
            (
                r * HEX_SHORTHAND_MULTIPLIER,
                g * HEX_SHORTHAND_MULTIPLIER,
                b * HEX_SHORTHAND_MULTIPLIER,
            )
        }
        6 => {
            let r = u8::from_str_radix(&hex[0..2], 16).context("Invalid red component")?;
            let g = u8::from_str_radix(&hex[2..4], 16).context("Invalid green component")?;
            let b = u8::from_str_radix(&hex[4..6], 16).context("Invalid blue component")?;
            (r, g, b)
        }
        _ => anyhow::bail!("Hex color must be 3 or 6 characters long (got: {})", hex),
    };

    Ok([r, g, b])
}

/// Parse a reference color specification
/// Accepts a hex color, "@x,y" to pick a pixel, or "auto"
pub fn parse_color_spec(spec: &str) -> Result<ColorSpec> {
    if spec == "auto" {
        return Ok(ColorSpec::Auto);
    }

    if let Some(coords) = spec.strip_prefix('@') {
        let (x, y) = coords
            .split_once(',')
            .with_context(|| format!("Pixel position must look like @x,y (got: {})", spec))?;
        let x = x.trim().parse().context("Invalid x coordinate")?;
        let y = y.trim().parse().context("Invalid y coordinate")?;
        return Ok(ColorSpec::Pixel(x, y));
    }

    parse_hex_color(spec).map(ColorSpec::Hex)
}

/// Format a color as "#rrggbb"
pub fn format_hex_color(color: Color) -> String {
    format!("#{:02x}{:02x}{:02x}", color[0], color[1], color[2])
}

/// Convert a Color to NormalizedColor
pub fn normalize_color(color: Color) -> NormalizedColor {
    [
        color[0] as f32 / CHANNEL_MAX,
        color[1] as f32 / CHANNEL_MAX,
        color[2] as f32 / CHANNEL_MAX,
    ]
}

/// Convert a NormalizedColor back to Color, clamping out-of-range channels
pub fn denormalize_color(color: NormalizedColor) -> Color {
    [
        denormalize_channel(color[0]),
        denormalize_channel(color[1]),
        denormalize_channel(color[2]),
    ]
}

/// Convert one normalized channel to 8 bits. NaN maps to 0.
pub fn denormalize_channel(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    (value * CHANNEL_MAX).round().clamp(0.0, CHANNEL_MAX) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#e6c8dc").unwrap(), [230, 200, 220]);
        assert_eq!(parse_hex_color("3c288c").unwrap(), [60, 40, 140]);
        assert_eq!(parse_hex_color("#fff").unwrap(), [255, 255, 255]);
        assert_eq!(parse_hex_color("369").unwrap(), [51, 102, 153]);

        assert!(parse_hex_color("ff").is_err());
        assert!(parse_hex_color("ffff").is_err());
        assert!(parse_hex_color("#gggggg").is_err());
        assert!(parse_hex_color("#ggg").is_err());
    }

    #[test]
    fn test_parse_color_spec() {
        assert_eq!(parse_color_spec("auto").unwrap(), ColorSpec::Auto);
        assert_eq!(
            parse_color_spec("#ff0000").unwrap(),
            ColorSpec::Hex([255, 0, 0])
        );
        assert_eq!(parse_color_spec("@3,14").unwrap(), ColorSpec::Pixel(3, 14));
        assert_eq!(parse_color_spec("@ 7 , 2").unwrap(), ColorSpec::Pixel(7, 2));

        assert!(parse_color_spec("@3").is_err());
        assert!(parse_color_spec("@-1,2").is_err());
        assert!(parse_color_spec("nuclei").is_err());
    }

    #[test]
    fn test_format_hex_color() {
        assert_eq!(format_hex_color([230, 200, 220]), "#e6c8dc");
        assert_eq!(
            parse_hex_color(&format_hex_color([1, 2, 3])).unwrap(),
            [1, 2, 3]
        );
    }

    #[test]
    fn test_normalize_color() {
        assert_eq!(normalize_color([255, 0, 0]), [1.0, 0.0, 0.0]);
        assert_eq!(normalize_color([51, 0, 0])[0], 51.0 / 255.0);
    }

    #[test]
    fn test_denormalize_clamps() {
        assert_eq!(denormalize_color([1.2, -0.3, 0.5]), [255, 0, 128]);
        assert_eq!(denormalize_channel(f32::NAN), 0);
    }
}
