//! Exclusive XML canonicalization (without comments), done by libxml2.

use libxml::tree::{
    c14n::{CanonicalizationMode, CanonicalizationOptions},
    Document, Node, NodeType,
};

use crate::{utils::is_element, SamlError, DSIG_NS};

fn exclusive() -> CanonicalizationOptions {
    CanonicalizationOptions {
        mode: CanonicalizationMode::ExclusiveCanonical1_0,
        with_comments: false,
        inclusive_ns_prefixes: vec![],
    }
}

fn canonicalization_failed() -> SamlError {
    SamlError::InvalidXml("canonicalization failed".into())
}

/// Canonical form of the subtree rooted at `node`.
pub fn canonicalize(node: &Node) -> Result<String, SamlError> {
    node.clone()
        .canonicalize(exclusive())
        .map_err(|_| canonicalization_failed())
}

/// Canonical form of `node` after the enveloped-signature transform, i.e. with
/// its immediate `ds:Signature` children removed.
///
/// `document` is left untouched; the signature is dropped from a copy.
pub fn canonicalize_enveloped(document: &Document, node: &Node) -> Result<String, SamlError> {
    let copy = document.dup().map_err(|_| canonicalization_failed())?;
    let mut target = copy
        .get_root_element()
        .ok_or(SamlError::MissingElement("root"))?;
    for index in element_path(node).into_iter().rev() {
        target = target
            .get_child_elements()
            .into_iter()
            .nth(index)
            .ok_or_else(canonicalization_failed)?;
    }

    for child in target.get_child_elements() {
        if is_element(&child, DSIG_NS, "Signature") {
            child.free_subtree();
        }
    }
    canonicalize(&target)
}

/// Child-element indices leading from `node` up to the root element, innermost first.
fn element_path(node: &Node) -> Vec<usize> {
    let mut path = Vec::new();
    let mut current = node.clone();
    while let Some(parent) = current.get_parent() {
        if parent.get_type() != Some(NodeType::ElementNode) {
            break;
        }
        let index = parent
            .get_child_elements()
            .iter()
            .position(|child| child == &current)
            .unwrap_or_default();
        path.push(index);
        current = parent;
    }
    path
}
