//! Table schema model.
//!
//! Schemas arrive as JSON text, are validated and given column-family ids
//! and a generation by the master, and are persisted back in a canonical
//! rendering. Field order is fixed by the struct declarations, so the
//! canonical form is stable across parse/render cycles.

use ht_core::{ErrorCode, Exception, Result};
use serde::{Deserialize, Serialize};

use crate::types::{COLUMN_LOCATION, COLUMN_START_ROW};

const MAX_COLUMN_FAMILIES: usize = 255;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFamily {
    pub name: String,
    /// Assigned by the master; 0 until `assign_ids` runs.
    #[serde(default)]
    pub id: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_versions: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGroup {
    pub name: String,
    pub column_families: Vec<ColumnFamily>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Bumped on every schema change; 0 until assigned.
    #[serde(default)]
    pub generation: u32,
    pub access_groups: Vec<AccessGroup>,
}

impl Schema {
    /// Parse and validate schema text. Failures carry `MasterBadSchema`.
    pub fn parse(text: &str) -> Result<Schema> {
        let schema: Schema = serde_json::from_str(text).map_err(|err| {
            Exception::new(ErrorCode::MasterBadSchema, format!("schema parse error: {err}"))
        })?;
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        if self.access_groups.is_empty() {
            return Err(bad_schema("schema has no access groups"));
        }
        let mut ag_names = std::collections::HashSet::new();
        let mut cf_names = std::collections::HashSet::new();
        let mut cf_count = 0usize;
        for ag in &self.access_groups {
            if ag.name.is_empty() {
                return Err(bad_schema("access group with empty name"));
            }
            if !ag_names.insert(ag.name.as_str()) {
                return Err(bad_schema(format!("duplicate access group '{}'", ag.name)));
            }
            for cf in &ag.column_families {
                if cf.name.is_empty() {
                    return Err(bad_schema("column family with empty name"));
                }
                if !cf_names.insert(cf.name.as_str()) {
                    return Err(bad_schema(format!("duplicate column family '{}'", cf.name)));
                }
                cf_count += 1;
            }
        }
        if cf_count == 0 {
            return Err(bad_schema("schema has no column families"));
        }
        if cf_count > MAX_COLUMN_FAMILIES {
            return Err(Exception::new(
                ErrorCode::TooManyColumns,
                format!("schema has {cf_count} column families"),
            ));
        }
        Ok(())
    }

    /// Assign column-family ids in declaration order and set the
    /// generation.
    pub fn assign_ids(&mut self) {
        let mut next_id = 1u8;
        for ag in &mut self.access_groups {
            for cf in &mut ag.column_families {
                cf.id = next_id;
                next_id += 1;
            }
        }
        if self.generation == 0 {
            self.generation = 1;
        }
    }

    /// Canonical rendering persisted as the table's `schema` attribute.
    pub fn render(&self) -> String {
        // Struct order is the canonical field order.
        serde_json::to_string_pretty(self).expect("schema rendering cannot fail")
    }

    pub fn column_family_id(&self, name: &str) -> Option<u8> {
        self.access_groups
            .iter()
            .flat_map(|ag| ag.column_families.iter())
            .find(|cf| cf.name == name)
            .map(|cf| cf.id)
    }

    pub fn access_group_names(&self) -> impl Iterator<Item = &str> {
        self.access_groups.iter().map(|ag| ag.name.as_str())
    }

    /// Built-in schema of the metadata table.
    pub fn metadata() -> Schema {
        let mut schema = Schema {
            generation: 0,
            access_groups: vec![AccessGroup {
                name: "default".to_string(),
                column_families: vec![
                    ColumnFamily {
                        name: COLUMN_START_ROW.to_string(),
                        id: 0,
                        max_versions: Some(1),
                    },
                    ColumnFamily {
                        name: COLUMN_LOCATION.to_string(),
                        id: 0,
                        max_versions: Some(1),
                    },
                    ColumnFamily {
                        name: "LogDir".to_string(),
                        id: 0,
                        max_versions: Some(1),
                    },
                    ColumnFamily {
                        name: "SplitPoint".to_string(),
                        id: 0,
                        max_versions: Some(1),
                    },
                    ColumnFamily {
                        name: "Files".to_string(),
                        id: 0,
                        max_versions: None,
                    },
                ],
            }],
        };
        schema.assign_ids();
        schema
    }

    /// Canonical text of the metadata schema, as fed to `create_table`.
    pub fn metadata_text() -> String {
        Self::metadata().render()
    }
}

fn bad_schema(message: impl Into<String>) -> Exception {
    Exception::new(ErrorCode::MasterBadSchema, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_group_schema() -> &'static str {
        r#"{
            "access_groups": [
                {"name": "default", "column_families": [{"name": "info"}, {"name": "tags"}]},
                {"name": "history", "column_families": [{"name": "events"}]}
            ]
        }"#
    }

    #[test]
    fn parse_assign_render_is_canonical() {
        let mut schema = Schema::parse(two_group_schema()).unwrap();
        schema.assign_ids();
        assert_eq!(schema.generation, 1);
        assert_eq!(schema.column_family_id("info"), Some(1));
        assert_eq!(schema.column_family_id("tags"), Some(2));
        assert_eq!(schema.column_family_id("events"), Some(3));

        // The canonical rendering parses back to the same schema and
        // re-renders identically.
        let rendered = schema.render();
        let reparsed = Schema::parse(&rendered).unwrap();
        assert_eq!(reparsed, schema);
        assert_eq!(reparsed.render(), rendered);
    }

    #[test]
    fn malformed_json_is_a_bad_schema() {
        let err = Schema::parse("{ not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::MasterBadSchema);
    }

    #[test]
    fn duplicate_column_family_is_rejected() {
        let err = Schema::parse(
            r#"{"access_groups": [{"name": "a", "column_families": [{"name": "x"}, {"name": "x"}]}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MasterBadSchema);
        assert!(err.message().contains('x'));
    }

    #[test]
    fn empty_schema_is_rejected() {
        let err = Schema::parse(r#"{"access_groups": []}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MasterBadSchema);
    }

    #[test]
    fn metadata_schema_names_the_locator_columns() {
        let schema = Schema::metadata();
        assert!(schema.column_family_id(COLUMN_START_ROW).is_some());
        assert!(schema.column_family_id(COLUMN_LOCATION).is_some());
        assert_eq!(schema.access_group_names().collect::<Vec<_>>(), vec!["default"]);
    }
}
