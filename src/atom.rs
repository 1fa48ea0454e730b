//! Atom types and content-derived identity.
//!
//! Atoms are the vertices and hyperedges of the knowledge graph. Identity
//! is derived from content: two atoms with the same type and name (or the
//! same type and outgoing set) are the same atom everywhere in the mesh,
//! which is what makes replica convergence possible without coordination.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::truth::TruthValue;

/// Content-derived atom identifier.
///
/// A handle is the blake3 digest of the atom's canonical encoding, so it
/// is stable across processes and nodes. Handles render as 64 lowercase
/// hex characters on the wire and in logs.
///
/// # Examples
///
/// ```
/// use cogmesh::{Atom, AtomType};
///
/// let a = Atom::node(AtomType::Concept, "water").unwrap();
/// let b = Atom::node(AtomType::Concept, "water").unwrap();
/// assert_eq!(a.handle(), b.handle());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handle([u8; 32]);

const NODE_DOMAIN: &[u8] = b"cogmesh:node\0";
const LINK_DOMAIN: &[u8] = b"cogmesh:link\0";

impl Handle {
    /// Length of the hex rendering.
    pub const HEX_LEN: usize = 64;

    /// Computes the handle of a node from its type and name.
    #[must_use]
    pub fn of_node(atom_type: &AtomType, name: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(NODE_DOMAIN);
        update_field(&mut hasher, atom_type.name().as_bytes());
        update_field(&mut hasher, name.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Computes the handle of a link from its type and ordered children.
    #[must_use]
    pub fn of_link(atom_type: &AtomType, outgoing: &[Handle]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(LINK_DOMAIN);
        update_field(&mut hasher, atom_type.name().as_bytes());
        // Child digests are fixed-width, so no prefix is needed here.
        for child in outgoing {
            hasher.update(&child.0);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Creates a handle from raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// All-zero handle, for sentinels in tests and error paths.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Renders the handle as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(Self::HEX_LEN);
        for byte in &self.0 {
            out.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0'));
            out.push(char::from_digit(u32::from(byte & 0x0f), 16).unwrap_or('0'));
        }
        out
    }
}

/// Length-prefixes a variable-width field so that bytes from one field
/// can never be read as part of an adjacent one.
fn update_field(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl FromStr for Handle {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.is_ascii() || s.len() != Self::HEX_LEN {
            return Err(ValidationError::InvalidHandle {
                reason: format!("expected {} hex characters, got {}", Self::HEX_LEN, s.len()),
            });
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &s[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|_| ValidationError::InvalidHandle {
                reason: format!("invalid hex at position {}", i * 2),
            })?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Handle {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Handle> for String {
    fn from(handle: Handle) -> Self {
        handle.to_hex()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.to_hex())
    }
}

/// Classification of atoms.
///
/// The well-known vocabulary gets dedicated variants; everything else is
/// carried verbatim as `Custom`, so agents can mint domain types without
/// a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AtomType {
    /// A named concept
    Concept,
    /// A named predicate
    Predicate,
    /// An is-a relation between two atoms
    Inheritance,
    /// A predicate applied to arguments
    Evaluation,
    /// An ordered grouping of atoms
    List,
    /// Any other type tag
    Custom(String),
}

impl AtomType {
    /// Creates an atom type from a name, mapping the well-known
    /// vocabulary onto dedicated variants.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyAtomType` if the name is empty or
    /// whitespace.
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        Self::try_from(name.into())
    }

    /// Returns the canonical type name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Concept => "ConceptNode",
            Self::Predicate => "PredicateNode",
            Self::Inheritance => "InheritanceLink",
            Self::Evaluation => "EvaluationLink",
            Self::List => "ListLink",
            Self::Custom(name) => name,
        }
    }
}

impl TryFrom<String> for AtomType {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyAtomType);
        }

        Ok(match trimmed {
            "ConceptNode" => Self::Concept,
            "PredicateNode" => Self::Predicate,
            "InheritanceLink" => Self::Inheritance,
            "EvaluationLink" => Self::Evaluation,
            "ListLink" => Self::List,
            other => Self::Custom(other.to_string()),
        })
    }
}

impl From<AtomType> for String {
    fn from(value: AtomType) -> Self {
        value.name().to_string()
    }
}

impl fmt::Display for AtomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A vertex or hyperedge of the knowledge graph.
///
/// Nodes are named; links reference an ordered, non-empty set of child
/// atoms by handle. Both carry a [`TruthValue`]. The two shapes are a
/// closed sum so call sites match exhaustively instead of probing
/// optional fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Atom {
    /// A named vertex.
    Node {
        /// Type tag.
        atom_type: AtomType,
        /// Node name, unique within the type.
        name: String,
        /// Graded truth.
        tv: TruthValue,
    },

    /// A hyperedge over other atoms.
    Link {
        /// Type tag.
        atom_type: AtomType,
        /// Ordered child handles. Order is significant for identity.
        outgoing: Vec<Handle>,
        /// Graded truth.
        tv: TruthValue,
    },
}

impl Atom {
    /// Creates a node with the default truth value.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyNodeName` if the name is empty or
    /// whitespace.
    pub fn node(atom_type: AtomType, name: impl Into<String>) -> Result<Self, ValidationError> {
        Self::node_with_tv(atom_type, name, TruthValue::default())
    }

    /// Creates a node with an explicit truth value.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyNodeName` if the name is empty or
    /// whitespace.
    pub fn node_with_tv(
        atom_type: AtomType,
        name: impl Into<String>,
        tv: TruthValue,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyNodeName);
        }
        Ok(Self::Node {
            atom_type,
            name,
            tv,
        })
    }

    /// Creates a link with the default truth value.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyOutgoingSet` if `outgoing` is empty.
    pub fn link(atom_type: AtomType, outgoing: Vec<Handle>) -> Result<Self, ValidationError> {
        Self::link_with_tv(atom_type, outgoing, TruthValue::default())
    }

    /// Creates a link with an explicit truth value.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyOutgoingSet` if `outgoing` is empty.
    pub fn link_with_tv(
        atom_type: AtomType,
        outgoing: Vec<Handle>,
        tv: TruthValue,
    ) -> Result<Self, ValidationError> {
        if outgoing.is_empty() {
            return Err(ValidationError::EmptyOutgoingSet);
        }
        Ok(Self::Link {
            atom_type,
            outgoing,
            tv,
        })
    }

    /// Computes this atom's content-derived handle.
    #[must_use]
    pub fn handle(&self) -> Handle {
        match self {
            Self::Node {
                atom_type, name, ..
            } => Handle::of_node(atom_type, name),
            Self::Link {
                atom_type,
                outgoing,
                ..
            } => Handle::of_link(atom_type, outgoing),
        }
    }

    /// Returns the type tag.
    #[must_use]
    pub fn atom_type(&self) -> &AtomType {
        match self {
            Self::Node { atom_type, .. } | Self::Link { atom_type, .. } => atom_type,
        }
    }

    /// Returns the truth value.
    #[must_use]
    pub fn tv(&self) -> &TruthValue {
        match self {
            Self::Node { tv, .. } | Self::Link { tv, .. } => tv,
        }
    }

    /// Replaces the truth value. Content identity is unaffected.
    pub fn set_tv(&mut self, tv: TruthValue) {
        match self {
            Self::Node { tv: slot, .. } | Self::Link { tv: slot, .. } => *slot = tv,
        }
    }

    /// Returns the node name, or `None` for links.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Node { name, .. } => Some(name),
            Self::Link { .. } => None,
        }
    }

    /// Returns the ordered child handles, or `None` for nodes.
    #[must_use]
    pub fn outgoing(&self) -> Option<&[Handle]> {
        match self {
            Self::Node { .. } => None,
            Self::Link { outgoing, .. } => Some(outgoing),
        }
    }

    /// Returns true for nodes.
    #[must_use]
    pub const fn is_node(&self) -> bool {
        matches!(self, Self::Node { .. })
    }

    /// Returns true for links.
    #[must_use]
    pub const fn is_link(&self) -> bool {
        matches!(self, Self::Link { .. })
    }

    /// Number of children: zero for nodes.
    #[must_use]
    pub fn arity(&self) -> usize {
        match self {
            Self::Node { .. } => 0,
            Self::Link { outgoing, .. } => outgoing.len(),
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node {
                atom_type,
                name,
                tv,
            } => write!(f, "({atom_type} \"{name}\" {tv})"),
            Self::Link {
                atom_type,
                outgoing,
                tv,
            } => {
                write!(f, "({atom_type} [")?;
                for (i, child) in outgoing.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", &child.to_hex()[..8])?;
                }
                write!(f, "] {tv})")
            }
        }
    }
}
