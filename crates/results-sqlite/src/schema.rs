pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE results (
  key             BLOB PRIMARY KEY,
  category        TEXT NOT NULL,
  payload         BLOB NOT NULL,
  stored_ms       INTEGER NOT NULL
);

CREATE INDEX idx_results_category ON results(category, stored_ms);

COMMIT;
"#
;
