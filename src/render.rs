//! # Background Rendering
//!
//! Paints backgrounds into an off-screen [`Canvas`] the size of the screen.
//!
//! - Built-in backgrounds are SVG files embedded in the binary and rasterised
//!   with resvg, stretched to the screen.
//! - Local files and community images are decoded with the `image` crate and
//!   scaled to the screen, ignoring aspect ratio.
//! - The community credit overlay (darkening gradient plus name, location and
//!   author) is generated as a small SVG document and drawn on top, so resvg
//!   does the text shaping with the system fonts.

use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use resvg::tiny_skia::{self, Pixmap, Transform};
use resvg::usvg;
use rust_embed::RustEmbed;
use std::path::Path;

use crate::community::CommunityMetadata;
use crate::error::{Error, Result};

/// SVG backgrounds shipped inside the binary (`inbuilt:<name>` → `<name>.svg`)
#[derive(RustEmbed)]
#[folder = "assets/backgrounds/"]
struct BuiltInAssets;

/// Names of all built-in backgrounds.
pub fn builtin_names() -> Vec<String> {
    let mut names: Vec<String> = BuiltInAssets::iter()
        .filter_map(|file| file.strip_suffix(".svg").map(str::to_string))
        .collect();
    names.sort();
    names
}

/// Size of the screen being painted, plus the UI scale used for label spacing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    /// 1.0 at 96 DPI
    pub scale: f32,
}

impl Geometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, scale: 1.0 }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
        self
    }
}

/// Screen-sized RGBA pixel buffer.
///
/// Always fully opaque: everything is painted over a black fill.
#[derive(Clone, PartialEq)]
pub struct Canvas {
    pixmap: Pixmap,
}

impl std::fmt::Debug for Canvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canvas")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

impl Canvas {
    /// A black canvas.
    pub fn new(geometry: Geometry) -> Result<Self> {
        let mut pixmap = Pixmap::new(geometry.width, geometry.height).ok_or_else(|| {
            Error::Svg(format!(
                "cannot create a {}x{} canvas",
                geometry.width, geometry.height
            ))
        })?;
        pixmap.fill(tiny_skia::Color::BLACK);
        Ok(Self { pixmap })
    }

    pub fn width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn height(&self) -> u32 {
        self.pixmap.height()
    }

    /// Paints `image` stretched over the whole canvas.
    fn draw_image(&mut self, image: &DynamicImage) {
        let scaled = image
            .resize_exact(self.width(), self.height(), FilterType::Lanczos3)
            .to_rgba8();

        // tiny-skia stores premultiplied RGBA. Compositing over the black fill
        // is exactly premultiplication with the alpha forced to opaque.
        for (dst, src) in self.pixmap.data_mut().chunks_exact_mut(4).zip(scaled.pixels()) {
            let [r, g, b, a] = src.0;
            let a = u16::from(a);
            dst[0] = ((u16::from(r) * a + 127) / 255) as u8;
            dst[1] = ((u16::from(g) * a + 127) / 255) as u8;
            dst[2] = ((u16::from(b) * a + 127) / 255) as u8;
            dst[3] = 255;
        }
    }

    /// Rasterises an SVG tree stretched over the whole canvas.
    fn draw_tree(&mut self, tree: &usvg::Tree) {
        let size = tree.size();
        let transform = Transform::from_scale(
            self.width() as f32 / size.width(),
            self.height() as f32 / size.height(),
        );
        resvg::render(tree, transform, &mut self.pixmap.as_mut());
    }

    /// Pixels as straight RGBA.
    pub fn to_rgba_image(&self) -> RgbaImage {
        // Opaque everywhere, so the premultiplied data is already straight alpha
        RgbaImage::from_raw(self.width(), self.height(), self.pixmap.data().to_vec())
            .unwrap_or_else(|| RgbaImage::new(self.width(), self.height()))
    }

    /// Pixels in the 32-bit BGRX layout X11 servers expect for depth-24 visuals.
    pub fn to_bgrx(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixmap.data().len());
        for px in self.pixmap.data().chunks_exact(4) {
            out.extend_from_slice(&[px[2], px[1], px[0], 0]);
        }
        out
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        self.to_rgba_image().save(path)?;
        Ok(())
    }
}

/// Escapes text for inclusion in SVG markup.
fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // Control characters other than tab and newlines are not allowed in XML
            c if c.is_control() && !matches!(c, '\t' | '\n' | '\r') => {}
            _ => out.push(c),
        }
    }
    out
}

/// Points to pixels at 96 DPI
fn pt(points: f32, scale: f32) -> f32 {
    points * 96.0 / 72.0 * scale
}

/// Builds the credit overlay for a community background.
///
/// Layout, 30px (scaled) in from the bottom-left and bottom-right corners:
/// name in 20pt, then location in 10pt slightly raised, and "by <author>"
/// right aligned. The darkening gradient runs from transparent at the top to
/// alpha 200 at the bottom.
pub fn label_overlay_svg(metadata: &CommunityMetadata, geometry: Geometry) -> String {
    let Geometry { width, height, scale } = geometry;
    let margin = 30.0 * scale;
    let baseline = height as f32 - margin;

    let mut svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">
<defs><linearGradient id="darkener" x1="0" y1="0" x2="0" y2="1">
<stop offset="0" stop-color="#000000" stop-opacity="0"/>
<stop offset="1" stop-color="#000000" stop-opacity="{opacity:.4}"/>
</linearGradient></defs>
<rect x="0" y="0" width="{width}" height="{height}" fill="url(#darkener)"/>
"##,
        opacity = 200.0 / 255.0,
    );

    let mut spans = String::new();
    if let Some(name) = &metadata.name {
        spans.push_str(&format!(
            r#"<tspan font-size="{:.2}">{}</tspan>"#,
            pt(20.0, scale),
            xml_escape(name)
        ));
    }
    if let Some(location) = &metadata.location {
        let dx = if spans.is_empty() { 0.0 } else { 9.0 * scale };
        spans.push_str(&format!(
            r#"<tspan dx="{:.2}" dy="{:.2}" font-size="{:.2}">{}</tspan>"#,
            dx,
            -6.0 * scale,
            pt(10.0, scale),
            xml_escape(location)
        ));
    }
    if !spans.is_empty() {
        svg.push_str(&format!(
            r##"<text x="{margin:.2}" y="{baseline:.2}" fill="#ffffff" font-family="sans-serif">{spans}</text>
"##
        ));
    }

    if let Some(author) = &metadata.author {
        svg.push_str(&format!(
            r##"<text x="{:.2}" y="{baseline:.2}" fill="#ffffff" font-family="sans-serif" font-size="{:.2}" text-anchor="end">by {}</text>
"##,
            width as f32 - margin,
            pt(10.0, scale),
            xml_escape(author)
        ));
    }

    svg.push_str("</svg>\n");
    svg
}

/// Centered white message on black, shown while nothing can be painted yet.
pub fn placeholder_svg(message: &str, geometry: Geometry) -> String {
    let Geometry { width, height, scale } = geometry;
    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">
<text x="{:.2}" y="{:.2}" fill="#ffffff" font-family="sans-serif" font-size="{:.2}" text-anchor="middle">{}</text>
</svg>
"##,
        width as f32 / 2.0,
        height as f32 / 2.0,
        pt(15.0, scale),
        xml_escape(message)
    )
}

/// Rasteriser holding the font database used for all text.
pub struct Renderer {
    options: usvg::Options<'static>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    /// Creates a renderer with the system fonts loaded.
    pub fn new() -> Self {
        let mut options = usvg::Options::default();
        options.fontdb_mut().load_system_fonts();
        tracing::debug!(faces = options.fontdb.len(), "loaded system fonts");
        Self { options }
    }

    /// Renderer with an empty font database; text draws nothing.
    #[cfg(test)]
    pub(crate) fn without_fonts() -> Self {
        Self {
            options: usvg::Options::default(),
        }
    }

    fn parse(&self, data: &[u8]) -> Result<usvg::Tree> {
        let tree = usvg::Tree::from_data(data, &self.options)?;
        let size = tree.size();
        if size.width() <= 0.0 || size.height() <= 0.0 {
            return Err(Error::Svg("SVG has an empty viewport".to_string()));
        }
        Ok(tree)
    }

    /// Renders an embedded SVG background at screen resolution.
    pub fn builtin(&self, name: &str, geometry: Geometry) -> Result<Canvas> {
        let asset = BuiltInAssets::get(&format!("{name}.svg"))
            .ok_or_else(|| Error::Svg(format!("no built-in background named {name:?}")))?;
        let tree = self.parse(&asset.data)?;

        let mut canvas = Canvas::new(geometry)?;
        canvas.draw_tree(&tree);
        Ok(canvas)
    }

    /// Loads a user image and scales it to the screen.
    pub fn local_file(&self, path: &Path, geometry: Geometry) -> Result<Canvas> {
        let image = image::open(path)?;
        let mut canvas = Canvas::new(geometry)?;
        canvas.draw_image(&image);
        Ok(canvas)
    }

    /// Composites a community image and, if requested, its credit labels.
    ///
    /// Labels are skipped when there is no metadata to take them from or the
    /// overlay does not parse; only an undecodable image is an error.
    pub fn community(
        &self,
        image_bytes: &[u8],
        metadata: Option<&CommunityMetadata>,
        show_labels: bool,
        geometry: Geometry,
    ) -> Result<Canvas> {
        let image = image::load_from_memory(image_bytes)?;
        let mut canvas = Canvas::new(geometry)?;
        canvas.draw_image(&image);

        if let (true, Some(metadata)) = (show_labels, metadata) {
            let overlay = label_overlay_svg(metadata, geometry);
            match self.parse(overlay.as_bytes()) {
                Ok(tree) => canvas.draw_tree(&tree),
                Err(e) => tracing::warn!("skipping credit labels: {e}"),
            }
        }
        Ok(canvas)
    }

    /// Black canvas with a centered message.
    pub fn placeholder(&self, message: &str, geometry: Geometry) -> Result<Canvas> {
        let mut canvas = Canvas::new(geometry)?;
        let svg = placeholder_svg(message, geometry);
        canvas.draw_tree(&self.parse(svg.as_bytes())?);
        Ok(canvas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn jpeg_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageOutputFormat::Jpeg(90))
            .unwrap();
        out.into_inner()
    }

    fn renderer() -> Renderer {
        Renderer::without_fonts()
    }

    #[test]
    fn test_builtin_assets_are_listed() {
        let names = builtin_names();
        assert!(names.contains(&"triangles".to_string()));
    }

    #[test]
    fn test_builtin_renders_at_screen_size() {
        let canvas = renderer().builtin("triangles", Geometry::new(320, 180)).unwrap();
        assert_eq!((canvas.width(), canvas.height()), (320, 180));
        // Not just the black fill
        assert!(canvas.to_rgba_image().pixels().any(|p| p.0[2] > 0));
    }

    #[test]
    fn test_unknown_builtin_is_an_error() {
        assert!(renderer().builtin("nope", Geometry::new(10, 10)).is_err());
    }

    #[test]
    fn test_local_file_is_stretched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        RgbImage::from_pixel(4, 2, Rgb([255, 0, 0])).save(&path).unwrap();

        let canvas = renderer().local_file(&path, Geometry::new(64, 64)).unwrap();
        let img = canvas.to_rgba_image();
        assert_eq!(img.dimensions(), (64, 64));
        assert_eq!(img.get_pixel(32, 32).0, [255, 0, 0, 255]);
    }

    #[test]
    fn test_community_render_is_deterministic() {
        let bytes = jpeg_bytes(40, 30, [10, 120, 200]);
        let meta = CommunityMetadata {
            name: Some("Lake".to_string()),
            location: Some("Somewhere".to_string()),
            author: Some("Sam".to_string()),
            filename: Some("lake.jpeg".to_string()),
        };
        let r = renderer();
        let geometry = Geometry::new(160, 90);

        let a = r.community(&bytes, Some(&meta), true, geometry).unwrap();
        let b = r.community(&bytes, Some(&meta), true, geometry).unwrap();
        assert_eq!(a, b);

        let plain = r.community(&bytes, Some(&meta), false, geometry).unwrap();
        assert_ne!(a, plain, "labels darken the bottom of the image");
    }

    #[test]
    fn test_gradient_darkens_towards_bottom() {
        let bytes = jpeg_bytes(16, 16, [200, 200, 200]);
        let canvas = renderer()
            .community(&bytes, Some(&CommunityMetadata::default()), true, Geometry::new(50, 100))
            .unwrap()
            .to_rgba_image();
        let top = canvas.get_pixel(25, 0).0[0];
        let bottom = canvas.get_pixel(25, 99).0[0];
        assert!(bottom < top, "top {top} bottom {bottom}");
    }

    #[test]
    fn test_control_characters_keep_the_labels() {
        let bytes = jpeg_bytes(16, 16, [10, 120, 200]);
        let meta = CommunityMetadata {
            name: Some("Lake\u{1}".to_string()),
            location: Some("North\u{7}".to_string()),
            ..Default::default()
        };
        let svg = label_overlay_svg(&meta, Geometry::new(32, 32));
        assert!(svg.contains(">Lake<"));
        assert!(!svg.contains('\u{1}'));

        let r = renderer();
        let labelled = r.community(&bytes, Some(&meta), true, Geometry::new(32, 32));
        assert!(labelled.is_ok());
    }

    #[test]
    fn test_undecodable_image_is_an_error() {
        let result = renderer().community(b"not an image", None, true, Geometry::new(8, 8));
        assert!(matches!(result, Err(Error::Image(_))));
    }

    #[test]
    fn test_overlay_escapes_text() {
        let meta = CommunityMetadata {
            name: Some("Rock & <Roll>".to_string()),
            author: Some("\"Q\"".to_string()),
            ..Default::default()
        };
        let svg = label_overlay_svg(&meta, Geometry::new(100, 100));
        assert!(svg.contains("Rock &amp; &lt;Roll&gt;"));
        assert!(svg.contains("by &quot;Q&quot;"));
        assert!(!svg.contains("tspan dx"), "no location span without a location");
        renderer().parse(svg.as_bytes()).unwrap();
    }

    #[test]
    fn test_bgrx_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.png");
        RgbImage::from_pixel(1, 1, Rgb([1, 2, 3])).save(&path).unwrap();
        let canvas = renderer().local_file(&path, Geometry::new(1, 1)).unwrap();
        assert_eq!(canvas.to_bgrx(), vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_placeholder_renders() {
        let canvas = renderer()
            .placeholder("Couldn't get community backgrounds!", Geometry::new(200, 100))
            .unwrap();
        assert_eq!(canvas.width(), 200);
    }
}
