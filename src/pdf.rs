//! Minimal PDF output: base-14 text and embedded PNG images.

use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::io::Write;
use std::path::Path;

use crate::config::{FontConfig, RectConfig};
use crate::error::AssemblyError;

/// Page-oriented drawing surface. Coordinates are points from the top-left
/// corner of the current page.
pub trait PageWriter {
    fn add_page(&mut self);
    fn set_x(&mut self, x: f64);
    fn set_y(&mut self, y: f64);
    /// Write one line of text at the cursor.
    fn cell(&mut self, text: &str);
    /// Move down `height` and back to the left edge.
    fn br(&mut self, height: f64);
    fn image(&mut self, path: &Path, x: f64, y: f64, rect: RectConfig) -> Result<(), AssemblyError>;
}

fn base_font(family: &str) -> Result<&'static str, AssemblyError> {
    match family.to_ascii_lowercase().as_str() {
        "helvetica" | "arial" | "sans" => Ok("Helvetica"),
        "times" | "times-roman" | "serif" => Ok("Times-Roman"),
        "courier" | "mono" => Ok("Courier"),
        _ => Err(AssemblyError::Font(family.to_string())),
    }
}

struct Image {
    width: u32,
    height: u32,
    /// zlib-compressed RGB8 samples
    data: Vec<u8>,
}

#[derive(Default)]
struct Page {
    ops: Vec<u8>,
}

pub struct PdfWriter {
    size: RectConfig,
    font: &'static str,
    font_size: f64,
    pages: Vec<Page>,
    images: Vec<Image>,
    x: f64,
    y: f64,
    /// Characters the base fonts could not show, printed as `?`.
    replaced: usize,
}

impl PdfWriter {
    pub fn new(size: RectConfig, font: &FontConfig) -> Result<Self, AssemblyError> {
        Ok(Self {
            size,
            font: base_font(&font.family)?,
            font_size: font.size,
            pages: Vec::new(),
            images: Vec::new(),
            x: 0.0,
            y: 0.0,
            replaced: 0,
        })
    }

    pub fn replaced_chars(&self) -> usize {
        self.replaced
    }

    fn current_page(&mut self) -> &mut Page {
        if self.pages.is_empty() {
            self.pages.push(Page::default());
        }
        let last = self.pages.len() - 1;
        &mut self.pages[last]
    }

    pub fn page_count(&self) -> usize {
        self.pages_to_emit().len()
    }

    // A page break after the last image leaves an empty page behind.
    fn pages_to_emit(&self) -> &[Page] {
        match self.pages.split_last() {
            Some((last, rest)) if last.ops.is_empty() && !rest.is_empty() => rest,
            _ => self.pages.as_slice(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let pages = self.pages_to_emit();
        let empty = [Page::default()];
        let pages = if pages.is_empty() { &empty[..] } else { pages };

        let first_image = 4;
        let first_page = first_image + self.images.len();
        let page_obj = |i: usize| first_page + 2 * i;

        let mut out = ObjectWriter::default();
        out.raw(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n");

        out.object(1, b"<< /Type /Catalog /Pages 2 0 R >>");
        let kids = (0..pages.len())
            .map(|i| format!("{} 0 R", page_obj(i)))
            .collect::<Vec<_>>()
            .join(" ");
        out.object(2, format!("<< /Type /Pages /Kids [{kids}] /Count {} >>", pages.len()).as_bytes());
        out.object(
            3,
            format!(
                "<< /Type /Font /Subtype /Type1 /BaseFont /{} /Encoding /WinAnsiEncoding >>",
                self.font
            )
            .as_bytes(),
        );

        for (i, img) in self.images.iter().enumerate() {
            let dict = format!(
                "<< /Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace /DeviceRGB /BitsPerComponent 8 /Filter /FlateDecode /Length {} >>",
                img.width,
                img.height,
                img.data.len()
            );
            out.stream(first_image + i, &dict, &img.data);
        }

        let xobjects = (0..self.images.len())
            .map(|i| format!("/Im{i} {} 0 R", first_image + i))
            .collect::<Vec<_>>()
            .join(" ");
        for (i, page) in pages.iter().enumerate() {
            let dict = format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {:.2} {:.2}] /Resources << /Font << /F1 3 0 R >> /XObject << {xobjects} >> >> /Contents {} 0 R >>",
                self.size.width,
                self.size.height,
                page_obj(i) + 1
            );
            out.object(page_obj(i), dict.as_bytes());
            out.stream(page_obj(i) + 1, &format!("<< /Length {} >>", page.ops.len()), &page.ops);
        }

        out.finish()
    }

    pub fn write_to(&self, path: &Path) -> Result<(), AssemblyError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    fn embed(&mut self, path: &Path) -> Result<usize, AssemblyError> {
        let decoded = image::open(path).map_err(|source| AssemblyError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();

        // flatten transparency onto white
        let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
        for px in rgba.pixels() {
            let [r, g, b, a] = px.0;
            let a = u16::from(a);
            for c in [r, g, b] {
                rgb.push(((u16::from(c) * a + 255 * (255 - a)) / 255) as u8);
            }
        }

        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&rgb)?;
        self.images.push(Image {
            width,
            height,
            data: enc.finish()?,
        });
        Ok(self.images.len() - 1)
    }
}

impl PageWriter for PdfWriter {
    fn add_page(&mut self) {
        self.pages.push(Page::default());
        self.x = 0.0;
        self.y = 0.0;
    }

    fn set_x(&mut self, x: f64) {
        self.x = x;
    }

    fn set_y(&mut self, y: f64) {
        self.y = y;
    }

    fn cell(&mut self, text: &str) {
        let baseline = self.size.height - self.y - self.font_size;
        let mut op = format!("BT /F1 {:.2} Tf {:.2} {:.2} Td (", self.font_size, self.x, baseline).into_bytes();
        let (escaped, replaced) = escape_text(text);
        if replaced > 0 {
            tracing::warn!("{replaced} character(s) of {text:?} outside Latin-1, printed as '?'");
            self.replaced += replaced;
        }
        op.extend(escaped);
        op.extend_from_slice(b") Tj ET\n");
        // rough advance for Helvetica-like widths
        self.x += text.chars().count() as f64 * self.font_size * 0.5;
        self.current_page().ops.extend(op);
    }

    fn br(&mut self, height: f64) {
        self.y += height;
        self.x = 0.0;
    }

    fn image(&mut self, path: &Path, x: f64, y: f64, rect: RectConfig) -> Result<(), AssemblyError> {
        let idx = self.embed(path)?;
        let bottom = self.size.height - y - rect.height;
        let op = format!(
            "q {:.2} 0 0 {:.2} {:.2} {:.2} cm /Im{idx} Do Q\n",
            rect.width, rect.height, x, bottom
        );
        self.current_page().ops.extend_from_slice(op.as_bytes());
        Ok(())
    }
}

/// Escape a PDF literal string; characters outside Latin-1 become `?`.
/// Returns the bytes and the number of characters replaced.
fn escape_text(text: &str) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(text.len());
    let mut replaced = 0;
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push(b'\\');
                out.push(c as u8);
            }
            c if (c as u32) < 0x100 && !c.is_control() => out.push(c as u32 as u8),
            _ => {
                out.push(b'?');
                replaced += 1;
            }
        }
    }
    (out, replaced)
}

/// Appends numbered objects and remembers their offsets for the xref table.
#[derive(Default)]
struct ObjectWriter {
    buf: Vec<u8>,
    offsets: Vec<usize>,
}

impl ObjectWriter {
    fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn begin(&mut self, num: usize) {
        debug_assert_eq!(num, self.offsets.len() + 1, "objects must be written in order");
        self.offsets.push(self.buf.len());
        self.raw(format!("{num} 0 obj\n").as_bytes());
    }

    fn object(&mut self, num: usize, body: &[u8]) {
        self.begin(num);
        self.raw(body);
        self.raw(b"\nendobj\n");
    }

    fn stream(&mut self, num: usize, dict: &str, data: &[u8]) {
        self.begin(num);
        self.raw(dict.as_bytes());
        self.raw(b"\nstream\n");
        self.raw(data);
        self.raw(b"\nendstream\nendobj\n");
    }

    fn finish(mut self) -> Vec<u8> {
        let xref_at = self.buf.len();
        let count = self.offsets.len() + 1;
        self.raw(format!("xref\n0 {count}\n0000000000 65535 f \n").as_bytes());
        for off in std::mem::take(&mut self.offsets) {
            self.raw(format!("{off:010} 00000 n \n").as_bytes());
        }
        self.raw(format!("trailer\n<< /Size {count} /Root 1 0 R >>\nstartxref\n{xref_at}\n%%EOF\n").as_bytes());
        self.buf
    }
}
