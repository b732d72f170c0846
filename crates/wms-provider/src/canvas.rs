//! Composition of fetched images into the requested view.

use image::imageops::{self, FilterType};
use image::RgbaImage;
use wms_common::BoundingBox;

/// Destination of a tile in device pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl DeviceRect {
    /// Whole pixel bounds; neighbouring rectangles share edges.
    fn pixel_bounds(&self) -> (i64, i64, i64, i64) {
        let x0 = self.x.round() as i64;
        let y0 = self.y.round() as i64;
        let x1 = (self.x + self.width).round() as i64;
        let y1 = (self.y + self.height).round() as i64;
        (x0, y0, x1, y1)
    }
}

/// How a drawn image combines with what is already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Composition {
    /// Alpha blend over existing pixels.
    SourceOver,
    /// Replace existing pixels.
    Source,
}

/// Output image of a draw together with the view it shows.
#[derive(Debug, Clone)]
pub struct MapCanvas {
    image: RgbaImage,
    view: BoundingBox,
}

impl MapCanvas {
    /// Transparent canvas of `width` x `height` pixels showing `view`.
    pub fn new(view: BoundingBox, width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
            view,
        }
    }

    pub fn view(&self) -> &BoundingBox {
        &self.view
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Linear map of a map rectangle to device pixels, y axis pointing down.
    pub fn device_rect(&self, rect: &BoundingBox) -> DeviceRect {
        let cx = self.view.width() / self.image.width().max(1) as f64;
        let cy = self.view.height() / self.image.height().max(1) as f64;
        DeviceRect {
            x: (rect.min_x - self.view.min_x) / cx,
            y: (self.view.max_y - rect.max_y) / cy,
            width: rect.width() / cx,
            height: rect.height() / cy,
        }
    }

    /// Draw `tile` scaled into the device rectangle of `rect`.
    pub fn draw_tile(
        &mut self,
        rect: &BoundingBox,
        tile: &RgbaImage,
        smooth: bool,
        composition: Composition,
    ) {
        let dst = self.device_rect(rect);
        self.draw_at(&dst, tile, smooth, composition);
    }

    pub fn draw_at(
        &mut self,
        dst: &DeviceRect,
        tile: &RgbaImage,
        smooth: bool,
        composition: Composition,
    ) {
        let (x0, y0, x1, y1) = dst.pixel_bounds();
        let (w, h) = (x1 - x0, y1 - y0);
        if w <= 0 || h <= 0 || tile.width() == 0 || tile.height() == 0 {
            return;
        }
        // Off-canvas tiles do not need to be scaled.
        if x1 <= 0 || y1 <= 0 || x0 >= self.image.width() as i64 || y0 >= self.image.height() as i64 {
            return;
        }

        let (w, h) = (w as u32, h as u32);
        let scaled;
        let source = if tile.width() == w && tile.height() == h {
            tile
        } else {
            let filter = if smooth {
                FilterType::Triangle
            } else {
                FilterType::Nearest
            };
            scaled = imageops::resize(tile, w, h, filter);
            &scaled
        };

        match composition {
            Composition::SourceOver => imageops::overlay(&mut self.image, source, x0, y0),
            Composition::Source => imageops::replace(&mut self.image, source, x0, y0),
        }
    }

    /// Draw an image unscaled with its top left corner at the origin.
    pub fn draw_image(&mut self, image: &RgbaImage) {
        imageops::overlay(&mut self.image, image, 0, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_device_rect() {
        let canvas = MapCanvas::new(BoundingBox::new(0.0, 0.0, 1000.0, 500.0), 100, 50);
        let dst = canvas.device_rect(&BoundingBox::new(100.0, 300.0, 300.0, 500.0));
        assert_eq!(
            dst,
            DeviceRect {
                x: 10.0,
                y: 0.0,
                width: 20.0,
                height: 20.0
            }
        );
    }

    #[test]
    fn test_draw_tile_scales_into_place() {
        let mut canvas = MapCanvas::new(BoundingBox::new(0.0, 0.0, 100.0, 100.0), 10, 10);
        let tile = RgbaImage::from_pixel(256, 256, Rgba([255, 0, 0, 255]));
        canvas.draw_tile(
            &BoundingBox::new(0.0, 50.0, 50.0, 100.0),
            &tile,
            false,
            Composition::SourceOver,
        );

        let img = canvas.image();
        assert_eq!(img.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
        assert_eq!(img.get_pixel(4, 4), &Rgba([255, 0, 0, 255]));
        assert_eq!(img.get_pixel(5, 5), &Rgba([0, 0, 0, 0]));
        assert_eq!(img.get_pixel(9, 0), &Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_source_replaces_pixels() {
        let mut canvas = MapCanvas::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 10, 10);
        let opaque = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 255, 255]));
        canvas.draw_image(&opaque);

        let clear = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 0]));
        canvas.draw_tile(
            &BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            &clear,
            false,
            Composition::SourceOver,
        );
        assert_eq!(canvas.image().get_pixel(3, 3), &Rgba([0, 0, 255, 255]));

        canvas.draw_tile(
            &BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            &clear,
            false,
            Composition::Source,
        );
        assert_eq!(canvas.image().get_pixel(3, 3), &Rgba([0, 0, 0, 0]));
    }
}
