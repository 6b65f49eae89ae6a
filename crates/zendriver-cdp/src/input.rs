//! `Input` domain: synthesized mouse and keyboard events.

use serde::Serialize;

use crate::{Command, EmptyResponse};

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MouseEventType {
    MousePressed,
    MouseReleased,
    MouseMoved,
    MouseWheel,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    None,
    Left,
    Middle,
    Right,
    Back,
    Forward,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMouseEvent {
    #[serde(rename = "type")]
    pub kind: MouseEventType,
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button: Option<MouseButton>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buttons: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifiers: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointer_type: Option<String>,
}

impl DispatchMouseEvent {
    pub fn moved(x: f64, y: f64) -> Self {
        Self::new(MouseEventType::MouseMoved, x, y)
    }

    pub fn pressed(x: f64, y: f64, button: MouseButton) -> Self {
        let mut event = Self::new(MouseEventType::MousePressed, x, y);
        event.button = Some(button);
        event.buttons = Some(1);
        event.click_count = Some(1);
        event
    }

    pub fn released(x: f64, y: f64, button: MouseButton) -> Self {
        let mut event = Self::new(MouseEventType::MouseReleased, x, y);
        event.button = Some(button);
        event.buttons = Some(1);
        event.click_count = Some(1);
        event
    }

    fn new(kind: MouseEventType, x: f64, y: f64) -> Self {
        Self {
            kind,
            x,
            y,
            button: None,
            buttons: None,
            click_count: None,
            modifiers: None,
            delta_x: None,
            delta_y: None,
            pointer_type: Some("mouse".into()),
        }
    }
}

impl Command for DispatchMouseEvent {
    const METHOD: &'static str = "Input.dispatchMouseEvent";
    type Response = EmptyResponse;
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyEventType {
    KeyDown,
    KeyUp,
    RawKeyDown,
    Char,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchKeyEvent {
    #[serde(rename = "type")]
    pub kind: KeyEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifiers: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub windows_virtual_key_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_virtual_key_code: Option<i64>,
}

impl DispatchKeyEvent {
    pub fn new(kind: KeyEventType) -> Self {
        Self {
            kind,
            modifiers: None,
            text: None,
            key: None,
            code: None,
            windows_virtual_key_code: None,
            native_virtual_key_code: None,
        }
    }
}

impl Command for DispatchKeyEvent {
    const METHOD: &'static str = "Input.dispatchKeyEvent";
    type Response = EmptyResponse;
}

#[derive(Clone, Debug, Serialize)]
pub struct InsertText {
    pub text: String,
}

impl Command for InsertText {
    const METHOD: &'static str = "Input.insertText";
    type Response = EmptyResponse;
}
