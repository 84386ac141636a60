use std::path::Path;

use crate::config::{LayoutConfig, RectConfig};
use crate::error::AssemblyError;
use crate::models::{Dashboard, Panel};
use crate::pdf::{PageWriter, PdfWriter};
use crate::render::image_path;

fn panel_rect(panel: &Panel, layout: &LayoutConfig) -> RectConfig {
    if panel.is_single_stat() {
        layout.rect.singlestat
    } else {
        layout.rect.graph
    }
}

/// Lay the dashboard out onto `writer`: a header with title and time range,
/// then the panel images in panel order, two per page (upper then lower),
/// breaking the page after every lower image.
pub fn assemble<W: PageWriter>(
    writer: &mut W,
    dash: &Dashboard,
    image_dir: &Path,
    layout: &LayoutConfig,
) -> Result<(), AssemblyError> {
    let pos = &layout.position;
    let time = &dash.ctx.time_range;

    writer.add_page();
    writer.set_y(pos.top);
    writer.set_x(pos.x);
    writer.cell(&format!("Dashboard: {}", dash.title));
    writer.br(pos.br);
    writer.set_x(pos.x);
    writer.cell(&format!("{} to {}", time.from_formatted(), time.to_formatted()));
    if !dash.variable_values.is_empty() {
        writer.br(pos.br);
        writer.set_x(pos.x);
        writer.cell(&format!("Variables: {}", dash.variable_values));
    }

    for (count, panel) in dash.panels.iter().enumerate() {
        let path = image_path(image_dir, panel.id);
        let rect = panel_rect(panel, layout);
        if count % 2 == 0 {
            writer.image(&path, pos.x, pos.y1, rect)?;
        } else {
            writer.image(&path, pos.x, pos.y2, rect)?;
            writer.add_page();
        }
        tracing::info!("Rendering image {} to PDF for panel {:?}", path.display(), panel.title);
    }
    Ok(())
}

/// Render `dash` to a PDF at `out`.
pub fn write_pdf(dash: &Dashboard, image_dir: &Path, layout: &LayoutConfig, out: &Path) -> Result<(), AssemblyError> {
    tracing::info!("PDF layout config: {layout:?}");
    let mut pdf = PdfWriter::new(layout.rect.page, &layout.font)?;
    assemble(&mut pdf, dash, image_dir, layout)?;
    pdf.write_to(out)?;
    tracing::info!("wrote {} page(s) to {}", pdf.page_count(), out.display());
    Ok(())
}
