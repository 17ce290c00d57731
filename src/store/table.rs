//! Closed set of mirrored tables and their static descriptions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every entity kind mirrored from the remote backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
  Categories,
  MenuItems,
  Tables,
  Staff,
  Shifts,
  Orders,
  OrderItems,
}

/// A field holding the id of a row in another table.
#[derive(Debug, Clone, Copy)]
pub struct Reference {
  pub field: &'static str,
  pub target: TableKind,
}

/// Static per-table description, resolved once through `TableKind::spec`.
#[derive(Debug)]
pub struct TableSpec {
  pub kind: TableKind,
  /// Path segment of the REST endpoint
  pub remote_path: &'static str,
  /// Needed before the till can take orders offline
  pub essential: bool,
  /// Column/value pair restricting pulls to active rows
  pub active_filter: Option<(&'static str, &'static str)>,
  pub references: &'static [Reference],
}

/// Registry in pull order: parents before the rows that point at them.
static REGISTRY: [TableSpec; 7] = [
  TableSpec {
    kind: TableKind::Categories,
    remote_path: "categories",
    essential: true,
    active_filter: Some(("is_active", "eq.true")),
    references: &[],
  },
  TableSpec {
    kind: TableKind::MenuItems,
    remote_path: "menu_items",
    essential: true,
    active_filter: Some(("is_active", "eq.true")),
    references: &[Reference {
      field: "category_id",
      target: TableKind::Categories,
    }],
  },
  TableSpec {
    kind: TableKind::Tables,
    remote_path: "tables",
    essential: true,
    active_filter: None,
    references: &[],
  },
  TableSpec {
    kind: TableKind::Staff,
    remote_path: "staff",
    essential: true,
    active_filter: Some(("is_active", "eq.true")),
    references: &[],
  },
  TableSpec {
    kind: TableKind::Shifts,
    remote_path: "shifts",
    essential: false,
    active_filter: None,
    references: &[Reference {
      field: "staff_id",
      target: TableKind::Staff,
    }],
  },
  TableSpec {
    kind: TableKind::Orders,
    remote_path: "orders",
    essential: false,
    active_filter: None,
    references: &[
      Reference {
        field: "table_id",
        target: TableKind::Tables,
      },
      Reference {
        field: "staff_id",
        target: TableKind::Staff,
      },
    ],
  },
  TableSpec {
    kind: TableKind::OrderItems,
    remote_path: "order_items",
    essential: false,
    active_filter: None,
    references: &[
      Reference {
        field: "order_id",
        target: TableKind::Orders,
      },
      Reference {
        field: "menu_item_id",
        target: TableKind::MenuItems,
      },
    ],
  },
];

impl TableKind {
  pub const ALL: [TableKind; 7] = [
    TableKind::Categories,
    TableKind::MenuItems,
    TableKind::Tables,
    TableKind::Staff,
    TableKind::Shifts,
    TableKind::Orders,
    TableKind::OrderItems,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      TableKind::Categories => "categories",
      TableKind::MenuItems => "menu_items",
      TableKind::Tables => "tables",
      TableKind::Staff => "staff",
      TableKind::Shifts => "shifts",
      TableKind::Orders => "orders",
      TableKind::OrderItems => "order_items",
    }
  }

  pub fn spec(self) -> &'static TableSpec {
    // REGISTRY is declared in the same order as ALL
    &REGISTRY[self as usize]
  }

  /// Tables that must be non-empty before the local mirror is usable.
  pub fn essential() -> impl Iterator<Item = TableKind> {
    REGISTRY.iter().filter(|s| s.essential).map(|s| s.kind)
  }

  /// Every `(table, field)` pair that points at rows of `self`.
  pub fn dependents(self) -> impl Iterator<Item = (TableKind, &'static str)> {
    REGISTRY.iter().flat_map(move |spec| {
      spec
        .references
        .iter()
        .filter(move |r| r.target == self)
        .map(move |r| (spec.kind, r.field))
    })
  }
}

impl fmt::Display for TableKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TableKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    TableKind::ALL
      .into_iter()
      .find(|k| k.as_str() == s)
      .ok_or_else(|| format!("unknown table: {}", s))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_registry_matches_kind_order() {
    for kind in TableKind::ALL {
      assert_eq!(kind.spec().kind, kind);
    }
  }

  #[test]
  fn test_parse_roundtrip() {
    for kind in TableKind::ALL {
      assert_eq!(kind.as_str().parse::<TableKind>().unwrap(), kind);
    }
    assert!("receipts".parse::<TableKind>().is_err());
  }

  #[test]
  fn test_dependents_of_orders() {
    let deps: Vec<_> = TableKind::Orders.dependents().collect();
    assert_eq!(deps, vec![(TableKind::OrderItems, "order_id")]);
  }

  #[test]
  fn test_dependents_of_staff() {
    let deps: Vec<_> = TableKind::Staff.dependents().collect();
    assert_eq!(
      deps,
      vec![(TableKind::Shifts, "staff_id"), (TableKind::Orders, "staff_id")]
    );
  }

  #[test]
  fn test_essential_tables() {
    let essential: Vec<_> = TableKind::essential().collect();
    assert!(essential.contains(&TableKind::MenuItems));
    assert!(!essential.contains(&TableKind::Orders));
  }
}
