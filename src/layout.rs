use super::*;

/// Vertical pre-trigger margin for the default visibility test: an element
/// gets 100 px of lead before it scrolls into the viewport.
const VERTICAL_PRETRIGGER_PX: f64 = 100.0;

/// Horizontal slack for the default visibility test, in viewport widths.
const HORIZONTAL_MARGIN_FACTOR: f64 = 3.0;

/// A bounding rectangle in page coordinates (origin at the viewport's
/// top-left, y growing downward), as a layout engine would report it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    /// Left edge.
    pub x: f64,
    /// Top edge.
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Left edge (alias for x).
    pub const fn left(&self) -> f64 {
        self.x
    }

    /// Top edge (alias for y).
    pub const fn top(&self) -> f64 {
        self.y
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }
}

/// The visible window the default test measures against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280.0,
            height: 720.0,
        }
    }
}

/// Default visibility test: the element's bounding rect overlaps the viewport
/// vertically with a 100 px pre-trigger margin and horizontally with a
/// 3x-viewport-width margin on each side.
///
/// Elements without a meaningful rect (the zero default) are not in view.
pub(crate) fn in_view(harness: &Harness, element: ElementId) -> bool {
    let Some(bounds) = harness.bounding_rect(element) else {
        return false;
    };
    let viewport = harness.viewport();
    vertically_visible(&bounds, &viewport) && horizontally_visible(&bounds, &viewport)
}

fn vertically_visible(bounds: &Rect, viewport: &Viewport) -> bool {
    bounds.top() - VERTICAL_PRETRIGGER_PX < viewport.height && bounds.bottom() > 0.0
}

fn horizontally_visible(bounds: &Rect, viewport: &Viewport) -> bool {
    let margin = HORIZONTAL_MARGIN_FACTOR * viewport.width;
    bounds.left() - margin < viewport.width && bounds.right() + margin > 0.0
}
