//! This module stores the column names shared by every stage of the pipeline. Raw extracts,
//! intermediate parquet files and the final output table must agree on these names.

// Raw extracts (one row per code/age/sex/year observation)
pub const CODE: &str = "code";
pub const OCCUPATION: &str = "occupation";
pub const AGE: &str = "age";
pub const SEX: &str = "sex";
pub const YEAR: &str = "year";
pub const COUNT: &str = "count";

// Provenance added while combining extracts
pub const SOURCE_FILE: &str = "source_file";
pub const SOURCE_RANK: &str = "source_rank";

// Hierarchy table
pub const LEVEL: &str = "level";
pub const SSYK_CODE: &str = "ssyk_code";

// Structure file mapping codes to occupation names
pub const NAME_MAP_CODE: &str = "code";
pub const NAME_MAP_NAME: &str = "name";

// Prefix columns derived from a level-4 code
pub const CODE_1: &str = "code_1";
pub const CODE_2: &str = "code_2";
pub const CODE_3: &str = "code_3";
pub const CODE_4: &str = "code_4";

// Weights and aggregates
pub const TOTAL_COUNT: &str = "total_count";
pub const WEIGHT_SUM: &str = "weight_sum";

/// Identity columns of a raw observation. Must be unique after resolution.
pub const IDENTITY: [&str; 4] = [CODE, AGE, SEX, YEAR];

/// Columns every raw extract must provide.
pub const REQUIRED_RAW: [&str; 5] = [CODE, AGE, SEX, YEAR, COUNT];

/// Literal used for `age`/`sex` when demographics are pooled.
pub const POOLED: &str = "total";
