use std::future::Future;

/// Window name shared by every login popup, so reopening focuses the existing one.
pub const POPUP_WINDOW_NAME: &str = "oauth-popup";

/// Screen position and outer size of the window that launches the popup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowBounds {
    pub screen_x: i32,
    pub screen_y: i32,
    pub outer_width: u32,
    pub outer_height: u32,
}

/// Placement of the login popup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopupGeometry {
    pub width: u32,
    pub height: u32,
    pub left: i32,
    pub top: i32,
}

impl PopupGeometry {
    /// Center a `width`×`height` popup over `parent`.
    ///
    /// A popup larger than its parent extends past the parent's top-left corner.
    #[must_use]
    pub fn centered(parent: WindowBounds, width: u32, height: u32) -> Self {
        let offset = |outer: u32, inner: u32| (i64::from(outer) - i64::from(inner)) / 2;
        let clamp = |v: i64| i32::try_from(v).unwrap_or(if v < 0 { i32::MIN } else { i32::MAX });

        Self {
            width,
            height,
            left: clamp(i64::from(parent.screen_x) + offset(parent.outer_width, width)),
            top: clamp(i64::from(parent.screen_y) + offset(parent.outer_height, height)),
        }
    }

    /// `window.open`-style feature string.
    #[must_use]
    pub fn features(&self) -> String {
        format!(
            "width={},height={},left={},top={},menubar=no,toolbar=no,location=no,status=no",
            self.width, self.height, self.left, self.top
        )
    }
}

/// Everything the host needs to open the popup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopupRequest {
    pub url: String,
    pub name: &'static str,
    pub geometry: PopupGeometry,
}

/// Handle to an opened popup window.
pub trait PopupWindow: Send + Sync + 'static {
    /// Close the window. Closing an already-closed window is a no-op.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Host capability that opens browser popup windows.
///
/// # Example
///
/// ```rust,ignore
/// impl PopupHost for ExtensionWindows {
///     type Window = BrowserWindow;
///
///     fn parent_bounds(&self) -> WindowBounds {
///         self.current_window_bounds()
///     }
///
///     async fn open(&self, request: PopupRequest) -> Option<BrowserWindow> {
///         self.windows.open(&request.url, request.name, &request.geometry.features()).await
///     }
/// }
/// ```
pub trait PopupHost: Send + Sync + 'static {
    type Window: PopupWindow;

    /// Current bounds of the calling window.
    fn parent_bounds(&self) -> WindowBounds;

    /// Open (or replace) the named popup. `None` means the host refused.
    fn open(&self, request: PopupRequest) -> impl Future<Output = Option<Self::Window>> + Send;
}

/// Open the login popup centered over the caller's window.
///
/// Returns `None` if the host blocked the popup; callers must fail the attempt.
pub async fn launch<H: PopupHost>(
    host: &H,
    url: &str,
    width: u32,
    height: u32,
) -> Option<H::Window> {
    let geometry = PopupGeometry::centered(host.parent_bounds(), width, height);
    let request = PopupRequest {
        url: url.to_string(),
        name: POPUP_WINDOW_NAME,
        geometry,
    };
    let window = host.open(request).await;
    if window.is_none() {
        tracing::warn!("Login popup was blocked by the host");
    }
    window
}
