//! `DOM` domain: node description, queries, attributes, geometry.

use serde::{Deserialize, Serialize};

use crate::runtime::RemoteObject;
use crate::{Command, EmptyResponse};

/// Identifier pushed to the client for a node in the current document.
/// Zero means "not pushed".
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub i64);

/// Backend node identifier, stable across `DOM.enable` cycles within a
/// document.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendNodeId(pub i64);

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: NodeId,
    pub backend_node_id: BackendNodeId,
    pub node_type: i64,
    pub node_name: String,
    #[serde(default)]
    pub local_name: String,
    #[serde(default)]
    pub node_value: String,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    /// Interleaved name/value pairs, as the protocol sends them.
    #[serde(default)]
    pub attributes: Option<Vec<String>>,
    #[serde(default)]
    pub children: Option<Vec<Node>>,
    #[serde(default)]
    pub child_node_count: Option<i64>,
    #[serde(default)]
    pub namespace_uri: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Enable {}

impl Command for Enable {
    const METHOD: &'static str = "DOM.enable";
    type Response = EmptyResponse;
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pierce: Option<bool>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GetDocumentResponse {
    pub root: Node,
}

impl Command for GetDocument {
    const METHOD: &'static str = "DOM.getDocument";
    type Response = GetDocumentResponse;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySelector {
    pub node_id: NodeId,
    pub selector: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySelectorResponse {
    pub node_id: NodeId,
}

impl Command for QuerySelector {
    const METHOD: &'static str = "DOM.querySelector";
    type Response = QuerySelectorResponse;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySelectorAll {
    pub node_id: NodeId,
    pub selector: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySelectorAllResponse {
    pub node_ids: Vec<NodeId>,
}

impl Command for QuerySelectorAll {
    const METHOD: &'static str = "DOM.querySelectorAll";
    type Response = QuerySelectorAllResponse;
}

/// Exactly one of the node locators should be set.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_node_id: Option<BackendNodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DescribeNodeResponse {
    pub node: Node,
}

impl Command for DescribeNode {
    const METHOD: &'static str = "DOM.describeNode";
    type Response = DescribeNodeResponse;
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_node_id: Option<BackendNodeId>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ResolveNodeResponse {
    pub object: RemoteObject,
}

impl Command for ResolveNode {
    const METHOD: &'static str = "DOM.resolveNode";
    type Response = ResolveNodeResponse;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestNode {
    pub object_id: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestNodeResponse {
    pub node_id: NodeId,
}

impl Command for RequestNode {
    const METHOD: &'static str = "DOM.requestNode";
    type Response = RequestNodeResponse;
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetBoxModel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_node_id: Option<BackendNodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

/// Quads are eight coordinates: x1 y1 x2 y2 x3 y3 x4 y4.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoxModel {
    pub content: Vec<f64>,
    #[serde(default)]
    pub padding: Vec<f64>,
    #[serde(default)]
    pub border: Vec<f64>,
    #[serde(default)]
    pub margin: Vec<f64>,
    pub width: f64,
    pub height: f64,
}

impl BoxModel {
    /// Center of the content quad, if the element occupies any area.
    pub fn content_center(&self) -> Option<(f64, f64)> {
        if self.content.len() < 8 || self.width <= 0.0 || self.height <= 0.0 {
            return None;
        }
        let xs = [self.content[0], self.content[2], self.content[4], self.content[6]];
        let ys = [self.content[1], self.content[3], self.content[5], self.content[7]];
        let x = xs.iter().sum::<f64>() / 4.0;
        let y = ys.iter().sum::<f64>() / 4.0;
        Some((x, y))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GetBoxModelResponse {
    pub model: BoxModel,
}

impl Command for GetBoxModel {
    const METHOD: &'static str = "DOM.getBoxModel";
    type Response = GetBoxModelResponse;
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollIntoViewIfNeeded {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_node_id: Option<BackendNodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

impl Command for ScrollIntoViewIfNeeded {
    const METHOD: &'static str = "DOM.scrollIntoViewIfNeeded";
    type Response = EmptyResponse;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAttributeValue {
    pub node_id: NodeId,
    pub name: String,
    pub value: String,
}

impl Command for SetAttributeValue {
    const METHOD: &'static str = "DOM.setAttributeValue";
    type Response = EmptyResponse;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveAttribute {
    pub node_id: NodeId,
    pub name: String,
}

impl Command for RemoveAttribute {
    const METHOD: &'static str = "DOM.removeAttribute";
    type Response = EmptyResponse;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAttributes {
    pub node_id: NodeId,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAttributesResponse {
    pub attributes: Vec<String>,
}

impl Command for GetAttributes {
    const METHOD: &'static str = "DOM.getAttributes";
    type Response = GetAttributesResponse;
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetOuterHtml {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_node_id: Option<BackendNodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetOuterHtmlResponse {
    pub outer_html: String,
}

impl Command for GetOuterHtml {
    const METHOD: &'static str = "DOM.getOuterHTML";
    type Response = GetOuterHtmlResponse;
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Focus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_node_id: Option<BackendNodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

impl Command for Focus {
    const METHOD: &'static str = "DOM.focus";
    type Response = EmptyResponse;
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetFileInputFiles {
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_node_id: Option<BackendNodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

impl Command for SetFileInputFiles {
    const METHOD: &'static str = "DOM.setFileInputFiles";
    type Response = EmptyResponse;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_center_averages_quad() {
        let model = BoxModel {
            content: vec![0.0, 0.0, 10.0, 0.0, 10.0, 20.0, 0.0, 20.0],
            padding: vec![],
            border: vec![],
            margin: vec![],
            width: 10.0,
            height: 20.0,
        };
        assert_eq!(model.content_center(), Some((5.0, 10.0)));
    }

    #[test]
    fn empty_box_has_no_center() {
        let model = BoxModel {
            content: vec![0.0; 8],
            padding: vec![],
            border: vec![],
            margin: vec![],
            width: 0.0,
            height: 0.0,
        };
        assert_eq!(model.content_center(), None);
    }
}
