//! Client for PxWeb (v1) statistical tables: read table metadata, resolve which variable plays
//! which role, request the full cube and reshape it into raw extract rows.

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use log::{debug, info, warn};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum_macros::Display;

use crate::config::FetchConfig;
use crate::error::{DaioeError, Result};
use crate::fetch::{TableFetcher, TableSpec};
use crate::COL;

/// Occupation codes with this suffix are "unknown occupation" rows.
const UNKNOWN_CODE_SUFFIX: &str = "0002";
/// Age bands with this suffix overlap the regular bands.
const OVERLAPPING_AGE_SUFFIX: &str = "-69";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Occupation,
    Age,
    Sex,
    Year,
    Observations,
}

impl Role {
    const ALL: [Role; 5] = [
        Role::Occupation,
        Role::Age,
        Role::Sex,
        Role::Year,
        Role::Observations,
    ];
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Variable {
    pub code: String,
    pub text: String,
    pub values: Vec<String>,
    #[serde(rename = "valueTexts")]
    pub value_texts: Vec<String>,
}

impl Variable {
    fn labels(&self) -> HashMap<&str, &str> {
        self.values
            .iter()
            .map(String::as_str)
            .zip(self.value_texts.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct TableMetadata {
    #[serde(default)]
    pub title: String,
    pub variables: Vec<Variable>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ResponseColumn {
    pub code: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DataRow {
    pub key: Vec<String>,
    pub values: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DataResponse {
    pub columns: Vec<ResponseColumn>,
    pub data: Vec<DataRow>,
}

/// Versioned mapping from PxWeb variable codes to the role they play. Matching is exact; a
/// table must provide exactly one variable per role.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RoleMap {
    pub version: String,
    pub variables: BTreeMap<String, Role>,
}

impl Default for RoleMap {
    fn default() -> Self {
        let variables = [
            ("Yrke2012", Role::Occupation),
            ("Yrke", Role::Occupation),
            ("Alder", Role::Age),
            ("Kon", Role::Sex),
            ("Tid", Role::Year),
            ("ContentsCode", Role::Observations),
        ]
        .into_iter()
        .map(|(code, role)| (code.to_string(), role))
        .collect();
        Self {
            version: "scb-am0208-v1".into(),
            variables,
        }
    }
}

/// One variable per role, resolved against a table's metadata.
#[derive(Debug, Clone)]
pub struct ResolvedRoles {
    roles: BTreeMap<Role, Variable>,
}

impl RoleMap {
    pub fn resolve(&self, variables: &[Variable]) -> Result<ResolvedRoles> {
        let mut matched: BTreeMap<Role, Vec<&Variable>> = BTreeMap::new();
        for variable in variables {
            match self.variables.get(&variable.code) {
                Some(role) => matched.entry(*role).or_default().push(variable),
                None => warn!(
                    "Variable '{}' ({}) has no role in map {}",
                    variable.code, variable.text, self.version
                ),
            }
        }
        let mut roles = BTreeMap::new();
        for role in Role::ALL {
            match matched.remove(&role).unwrap_or_default().as_slice() {
                [variable] => {
                    roles.insert(role, (*variable).clone());
                }
                [] => {
                    return Err(DaioeError::MissingRole {
                        role: role.to_string(),
                        available: variables.iter().map(|v| v.code.clone()).collect(),
                    })
                }
                many => {
                    return Err(DaioeError::AmbiguousRole {
                        role: role.to_string(),
                        variables: many.iter().map(|v| v.code.clone()).collect(),
                    })
                }
            }
        }
        debug!("Resolved roles with map {}", self.version);
        Ok(ResolvedRoles { roles })
    }
}

impl ResolvedRoles {
    fn get(&self, role: Role) -> Result<&Variable> {
        self.roles.get(&role).ok_or_else(|| DaioeError::MissingRole {
            role: role.to_string(),
            available: vec![],
        })
    }

    /// Query selecting every value of each dimension and the first observation measure.
    pub fn full_query(&self) -> Value {
        let query = self
            .roles
            .iter()
            .filter_map(|(role, variable)| {
                let values = if *role == Role::Observations {
                    variable.values.first().cloned().into_iter().collect_vec()
                } else {
                    variable.values.clone()
                };
                (!values.is_empty()).then(|| {
                    json!({
                        "code": variable.code,
                        "selection": {"filter": "item", "values": values}
                    })
                })
            })
            .collect_vec();
        json!({"query": query, "response": {"format": "json"}})
    }

    /// Reshape a data response into `code, occupation, age, sex, year, count`.
    ///
    /// Occupation and sex codes are labelled through the metadata value texts (the code is kept
    /// when there is no text). Unknown-occupation rows and overlapping age bands are dropped.
    /// Counts that are not integers (e.g. `..`) become null.
    pub fn transform(&self, response: &DataResponse) -> Result<DataFrame> {
        let dimensions = response
            .columns
            .iter()
            .filter(|c| c.kind != "c")
            .map(|c| c.code.as_str())
            .collect_vec();
        let position = |role: Role| -> Result<usize> {
            let code = &self.get(role)?.code;
            dimensions
                .iter()
                .position(|d| d == code)
                .ok_or_else(|| DaioeError::Payload(format!("no key column for {role} ({code})")))
        };
        let (occ_at, age_at, sex_at, year_at) = (
            position(Role::Occupation)?,
            position(Role::Age)?,
            position(Role::Sex)?,
            position(Role::Year)?,
        );
        let occupation_labels = self.get(Role::Occupation)?.labels();
        let sex_labels = self.get(Role::Sex)?.labels();

        let n = response.data.len();
        let (mut codes, mut occupations, mut ages, mut sexes, mut years, mut counts) = (
            Vec::with_capacity(n),
            Vec::with_capacity(n),
            Vec::with_capacity(n),
            Vec::with_capacity(n),
            Vec::with_capacity(n),
            Vec::with_capacity(n),
        );
        for row in &response.data {
            if row.key.len() != dimensions.len() {
                return Err(DaioeError::Payload(format!(
                    "key {:?} does not match dimensions {:?}",
                    row.key, dimensions
                )));
            }
            let code = row.key[occ_at].as_str();
            let sex = row.key[sex_at].as_str();
            codes.push(code.to_string());
            occupations.push(occupation_labels.get(code).copied().unwrap_or(code).to_string());
            ages.push(row.key[age_at].clone());
            sexes.push(sex_labels.get(sex).copied().unwrap_or(sex).to_string());
            years.push(row.key[year_at].clone());
            counts.push(row.values.first().and_then(|v| v.trim().parse::<i64>().ok()));
        }

        let df = DataFrame::new(vec![
            Series::new(COL::CODE, codes),
            Series::new(COL::OCCUPATION, occupations),
            Series::new(COL::AGE, ages),
            Series::new(COL::SEX, sexes),
            Series::new(COL::YEAR, years),
            Series::new(COL::COUNT, counts),
        ])?;
        Ok(df
            .lazy()
            .filter(
                col(COL::CODE)
                    .str()
                    .ends_with(lit(UNKNOWN_CODE_SUFFIX))
                    .not()
                    .and(col(COL::AGE).str().ends_with(lit(OVERLAPPING_AGE_SUFFIX)).not()),
            )
            .with_column(col(COL::YEAR).cast(DataType::Int64))
            .collect()?)
    }
}

/// Fetches tables from a PxWeb v1 API.
pub struct PxWebFetcher {
    client: reqwest::Client,
    base_url: String,
    language: String,
    roles: RoleMap,
}

impl PxWebFetcher {
    pub fn new(base_url: &str, language: &str, roles: RoleMap) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            language: language.to_string(),
            roles,
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(&config.base_url, &config.language, RoleMap::default())
    }

    pub fn table_url(&self, table: &TableSpec) -> String {
        format!("{}/{}/table/{}", self.base_url, self.language, table.path)
    }
}

impl TableFetcher for PxWebFetcher {
    async fn fetch(&self, table: &TableSpec) -> Result<DataFrame> {
        let url = self.table_url(table);
        info!("Fetching {} from {url}", table.id);
        let metadata: TableMetadata = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("{}: '{}' with {} variables", table.id, metadata.title, metadata.variables.len());
        let roles = self.roles.resolve(&metadata.variables)?;
        let response: DataResponse = self
            .client
            .post(&url)
            .json(&roles.full_query())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        roles.transform(&response)
    }
}
