//! SQL parser
//!
//! String-scanning parser producing the tagged [`Command`] tree. There
//! is no tokenizer: statements are recognized by their leading keyword
//! and fields are carved out with top-level keyword searches that skip
//! anything inside balanced parentheses or quoted strings.

use crate::catalog::{Field, ForeignKeyDef, Record, ReferentialAction, TableSchema};
use crate::error::{Error, Result};
use crate::sql::ast::*;
use crate::sql::text::{
    ascii_upper, find_keyword_top_level, last_top_level_space, matching_paren,
    normalize_whitespace, split_statements, split_top_level, strip_comments, strip_ident_quotes,
    strip_value_quotes,
};

/// SQL parser entry points.
pub struct Parser;

impl Parser {
    /// Parse one statement into a command.
    pub fn parse(sql: &str) -> Result<Command> {
        let prepared = prepare(sql);
        if prepared.is_empty() {
            return Err(Error::Syntax(sql.trim().to_string()));
        }
        parse_prepared(&prepared)
    }

    /// Split a script on top-level `;` and parse every statement.
    pub fn parse_script(script: &str) -> Result<Vec<Command>> {
        let stripped = strip_comments(script);
        split_statements(&stripped)
            .iter()
            .map(|stmt| Parser::parse(stmt))
            .collect()
    }
}

/// Strip comments, drop a trailing `;`, and collapse whitespace.
fn prepare(sql: &str) -> String {
    let stripped = strip_comments(sql);
    let mut sql = normalize_whitespace(&stripped);
    if sql.ends_with(';') {
        sql.pop();
        sql = sql.trim_end().to_string();
    }
    sql
}

fn syntax(fragment: &str) -> Error {
    Error::Syntax(fragment.trim().to_string())
}

fn parse_prepared(sql: &str) -> Result<Command> {
    let upper = ascii_upper(sql);

    if let Some(rest) = strip_prefix_ci(sql, &upper, "CREATE DATABASE ") {
        let db = rest.trim();
        if db.is_empty() {
            return Err(syntax(sql));
        }
        return Ok(Command::CreateDatabase {
            db: strip_ident_quotes(db).to_string(),
        });
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "USE ") {
        let db = rest.trim();
        if db.is_empty() {
            return Err(syntax(sql));
        }
        return Ok(Command::UseDatabase {
            db: strip_ident_quotes(db).to_string(),
        });
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "DROP DATABASE ") {
        let (name, action) = take_trailing_action(rest.trim());
        if name.is_empty() {
            return Err(syntax(sql));
        }
        return Ok(Command::DropDatabase {
            db: strip_ident_quotes(&name).to_string(),
            action,
        });
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "BACKUP DATABASE ") {
        let rest_upper = ascii_upper(rest);
        let to = find_keyword_top_level(&rest_upper, " TO ", 0).ok_or_else(|| syntax(sql))?;
        let db = rest[..to].trim();
        let path = strip_value_quotes(rest[to + 4..].trim());
        if db.is_empty() || path.is_empty() {
            return Err(syntax(sql));
        }
        return Ok(Command::BackupDatabase {
            db: db.to_string(),
            path: path.to_string(),
        });
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "RESTORE DATABASE ") {
        let rest_upper = ascii_upper(rest);
        let from = find_keyword_top_level(&rest_upper, " FROM ", 0).ok_or_else(|| syntax(sql))?;
        let db = rest[..from].trim();
        let path = strip_value_quotes(rest[from + 6..].trim());
        if db.is_empty() || path.is_empty() {
            return Err(syntax(sql));
        }
        return Ok(Command::RestoreDatabase {
            db: db.to_string(),
            path: path.to_string(),
        });
    }

    match upper.as_str() {
        "BEGIN" | "BEGIN TRANSACTION" | "START TRANSACTION" => return Ok(Command::Begin),
        "COMMIT" => return Ok(Command::Commit),
        "ROLLBACK" => return Ok(Command::Rollback),
        "CHECKPOINT" => return Ok(Command::Checkpoint),
        _ => {}
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "ROLLBACK TO ") {
        let mut name = rest.trim();
        let name_upper = ascii_upper(name);
        if name_upper.starts_with("SAVEPOINT ") {
            name = name["SAVEPOINT ".len()..].trim();
        }
        if name.is_empty() {
            return Err(syntax(sql));
        }
        return Ok(Command::RollbackToSavepoint {
            name: name.to_string(),
        });
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "RELEASE SAVEPOINT ") {
        let name = rest.trim();
        if name.is_empty() {
            return Err(syntax(sql));
        }
        return Ok(Command::ReleaseSavepoint {
            name: name.to_string(),
        });
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "SAVEPOINT ") {
        let name = rest.trim();
        if name.is_empty() {
            return Err(syntax(sql));
        }
        return Ok(Command::Savepoint {
            name: name.to_string(),
        });
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "CREATE USER ") {
        let rest_upper = ascii_upper(rest);
        let by = find_keyword_top_level(&rest_upper, " IDENTIFIED BY ", 0)
            .ok_or_else(|| syntax(sql))?;
        let username = strip_value_quotes(rest[..by].trim()).to_string();
        let password = strip_value_quotes(rest[by + " IDENTIFIED BY ".len()..].trim()).to_string();
        return Ok(Command::CreateUser { username, password });
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "DROP USER ") {
        return Ok(Command::DropUser {
            username: strip_value_quotes(rest.trim()).to_string(),
        });
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "GRANT ") {
        let rest_upper = ascii_upper(rest);
        let on = find_keyword_top_level(&rest_upper, " ON ", 0).ok_or_else(|| syntax(sql))?;
        let to = find_keyword_top_level(&rest_upper, " TO ", on).ok_or_else(|| syntax(sql))?;
        return Ok(Command::Grant {
            privileges: parse_privileges(&rest[..on]),
            table: rest[on + 4..to].trim().to_string(),
            username: strip_value_quotes(rest[to + 4..].trim()).to_string(),
        });
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "REVOKE ") {
        let rest_upper = ascii_upper(rest);
        let on = find_keyword_top_level(&rest_upper, " ON ", 0).ok_or_else(|| syntax(sql))?;
        let from = find_keyword_top_level(&rest_upper, " FROM ", on).ok_or_else(|| syntax(sql))?;
        return Ok(Command::Revoke {
            privileges: parse_privileges(&rest[..on]),
            table: rest[on + 4..from].trim().to_string(),
            username: strip_value_quotes(rest[from + 6..].trim()).to_string(),
        });
    }

    if upper.starts_with("CREATE INDEX ") || upper.starts_with("CREATE UNIQUE INDEX ") {
        return parse_create_index(sql, &upper);
    }

    if upper.starts_with("ALTER TABLE ") {
        return parse_alter_table(sql);
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "DROP INDEX ") {
        let rest_upper = ascii_upper(rest);
        let on = find_keyword_top_level(&rest_upper, " ON ", 0).ok_or_else(|| syntax(sql))?;
        return Ok(Command::DropIndex {
            index: rest[..on].trim().to_string(),
            table: rest[on + 4..].trim().to_string(),
        });
    }

    if upper.starts_with("SHOW INDEX") {
        let rest_upper = ascii_upper(sql);
        let from = find_keyword_top_level(&rest_upper, " FROM ", 0).ok_or_else(|| syntax(sql))?;
        return Ok(Command::ShowIndexes {
            table: sql[from + 6..].trim().to_string(),
        });
    }

    if upper.starts_with("SHOW TABLES") {
        let rest = sql["SHOW TABLES".len()..].trim();
        let rest_upper = ascii_upper(rest);
        let db = if rest_upper.starts_with("FROM ") {
            Some(rest[5..].trim().to_string())
        } else {
            None
        };
        return Ok(Command::ShowTables { db });
    }

    if upper.starts_with("CREATE VIEW ") || upper.starts_with("CREATE OR REPLACE VIEW ") {
        return parse_create_view(sql, &upper);
    }

    if upper.starts_with("CREATE TABLE ") {
        return parse_create_table(sql, &upper);
    }

    if upper.starts_with("INSERT INTO ") {
        return parse_insert(sql, &upper);
    }

    if upper.starts_with("DELETE FROM ") {
        return parse_delete(sql);
    }

    if upper.starts_with("UPDATE ") {
        return parse_update(sql, &upper);
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "DROP TABLE ") {
        let (name, action) = take_trailing_action(rest.trim());
        if name.is_empty() {
            return Err(syntax(sql));
        }
        return Ok(Command::DropTable {
            table: strip_ident_quotes(&name).to_string(),
            action,
        });
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "DROP VIEW ") {
        let mut rest = rest.trim();
        let mut if_exists = false;
        if ascii_upper(rest).starts_with("IF EXISTS") {
            if_exists = true;
            rest = rest["IF EXISTS".len()..].trim();
        }
        if rest.is_empty() && !if_exists {
            return Err(syntax(sql));
        }
        return Ok(Command::DropView {
            view: strip_ident_quotes(rest).to_string(),
            if_exists,
        });
    }

    if let Some(rest) = strip_prefix_ci(sql, &upper, "RENAME TABLE ") {
        let rest_upper = ascii_upper(rest);
        let to = find_keyword_top_level(&rest_upper, " TO ", 0).ok_or_else(|| syntax(sql))?;
        return Ok(Command::RenameTable {
            table: strip_ident_quotes(rest[..to].trim()).to_string(),
            new_name: strip_ident_quotes(rest[to + 4..].trim()).to_string(),
        });
    }

    if upper.starts_with("SELECT") {
        let plan = parse_select(sql, &upper)?;
        return Ok(Command::Select { plan });
    }

    Err(syntax(sql))
}

/// Case-insensitive prefix strip using the precomputed uppercase copy.
fn strip_prefix_ci<'a>(sql: &'a str, upper: &str, prefix: &str) -> Option<&'a str> {
    if upper.starts_with(prefix) {
        Some(&sql[prefix.len()..])
    } else {
        None
    }
}

fn parse_privileges(list: &str) -> Vec<String> {
    let mut privileges: Vec<String> = list
        .split(',')
        .map(|p| p.trim().to_ascii_uppercase())
        .filter(|p| !p.is_empty())
        .collect();
    if privileges.iter().any(|p| p == "ALL") {
        privileges = ["SELECT", "INSERT", "UPDATE", "DELETE", "CREATE", "DROP"]
            .iter()
            .map(|s| s.to_string())
            .collect();
    }
    privileges
}

/// Pop a trailing RESTRICT / CASCADE / SET NULL token.
fn take_trailing_action(s: &str) -> (String, Option<ReferentialAction>) {
    let trimmed = s.trim();
    let upper = ascii_upper(trimmed);
    for (token, action) in [
        ("SET NULL", ReferentialAction::SetNull),
        ("RESTRICT", ReferentialAction::Restrict),
        ("CASCADE", ReferentialAction::Cascade),
    ] {
        if upper.ends_with(token) && upper.len() > token.len() {
            let head = trimmed[..trimmed.len() - token.len()].trim_end();
            return (head.to_string(), Some(action));
        }
    }
    (trimmed.to_string(), None)
}

fn parse_create_index(sql: &str, upper: &str) -> Result<Command> {
    let unique = upper.starts_with("CREATE UNIQUE INDEX ");
    let prefix_len = if unique {
        "CREATE UNIQUE INDEX ".len()
    } else {
        "CREATE INDEX ".len()
    };
    let rest = &sql[prefix_len..];
    let rest_upper = ascii_upper(rest);
    let on = find_keyword_top_level(&rest_upper, " ON ", 0).ok_or_else(|| syntax(sql))?;
    let index = rest[..on].trim().to_string();
    let after_on = &rest[on + 4..];
    let open = after_on.find('(').ok_or_else(|| syntax(sql))?;
    let close = matching_paren(after_on, open).ok_or_else(|| syntax(sql))?;
    let table = after_on[..open].trim().to_string();
    let column = after_on[open + 1..close].trim().to_string();
    if index.is_empty() || table.is_empty() || column.is_empty() {
        return Err(syntax(sql));
    }
    Ok(Command::CreateIndex {
        index,
        table,
        column,
        unique,
    })
}

/// Column definition: `name type [PRIMARY KEY] [NOT NULL]`, with the
/// declared size lifted out of `char[n]` / `char(n)` style types.
fn parse_column_def(def: &str) -> Result<Field> {
    let parts: Vec<&str> = def.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(syntax(def));
    }
    let mut field = Field::new(strip_ident_quotes(parts[0]), parts[1]);
    field.size = declared_size(parts[1]);
    let mut i = 2;
    while i < parts.len() {
        let token = parts[i].to_ascii_uppercase();
        if token == "PRIMARY" && i + 1 < parts.len() && parts[i + 1].eq_ignore_ascii_case("KEY") {
            field.is_key = true;
            field.nullable = false;
            i += 2;
        } else if token == "NOT" && i + 1 < parts.len() && parts[i + 1].eq_ignore_ascii_case("NULL")
        {
            field.nullable = false;
            i += 2;
        } else {
            i += 1;
        }
    }
    Ok(field)
}

fn declared_size(type_name: &str) -> u32 {
    let open = type_name.find(['[', '(']);
    let close = type_name.rfind([']', ')']);
    if let (Some(open), Some(close)) = (open, close) {
        if close > open {
            return type_name[open + 1..close].trim().parse().unwrap_or(0);
        }
    }
    0
}

/// Parse a `[CONSTRAINT name] FOREIGN KEY (cols) REFERENCES t [(cols)]
/// [ON DELETE action] [ON UPDATE action]` clause. `Ok(None)` when the
/// input is not a foreign-key clause at all.
fn parse_foreign_key_clause(input: &str) -> Result<Option<ForeignKeyDef>> {
    let mut work = input.trim().to_string();
    let mut fk = ForeignKeyDef::default();
    let upper = ascii_upper(&work);
    if upper.starts_with("CONSTRAINT ") {
        let rest = work["CONSTRAINT ".len()..].trim().to_string();
        let space = rest.find(' ').ok_or_else(|| syntax(input))?;
        fk.name = strip_ident_quotes(&rest[..space]).to_string();
        work = rest[space + 1..].trim().to_string();
    }
    let upper = ascii_upper(&work);
    let fk_pos = match upper.find("FOREIGN KEY") {
        Some(pos) => pos,
        None => return Ok(None),
    };
    let open = work[fk_pos..]
        .find('(')
        .map(|p| p + fk_pos)
        .ok_or_else(|| syntax(input))?;
    let close = matching_paren(&work, open).ok_or_else(|| syntax(input))?;
    for col in split_top_level(&work[open + 1..close], ',') {
        let col = strip_ident_quotes(&col);
        if !col.is_empty() {
            fk.columns.push(col.to_string());
        }
    }
    let after = work[close + 1..].trim();
    let after_upper = ascii_upper(after);
    let ref_pos = after_upper
        .find("REFERENCES")
        .ok_or_else(|| syntax(input))?;
    let mut ref_body = after[ref_pos + "REFERENCES".len()..].trim().to_string();
    if ref_body.is_empty() {
        return Err(syntax(input));
    }
    if let Some(open) = ref_body.find('(') {
        let close = matching_paren(&ref_body, open).ok_or_else(|| syntax(input))?;
        fk.ref_table = strip_ident_quotes(&ref_body[..open]).to_string();
        for col in split_top_level(&ref_body[open + 1..close], ',') {
            let col = strip_ident_quotes(&col);
            if !col.is_empty() {
                fk.ref_columns.push(col.to_string());
            }
        }
        ref_body = ref_body[close + 1..].trim().to_string();
    } else {
        // The table name may be followed by ON DELETE / ON UPDATE.
        let upper_body = ascii_upper(&ref_body);
        let end = upper_body.find(" ON ").unwrap_or(ref_body.len());
        fk.ref_table = strip_ident_quotes(&ref_body[..end]).to_string();
        ref_body = ref_body[end..].trim().to_string();
    }
    let actions = ref_body;
    let actions_upper = ascii_upper(&actions);
    for (key, slot) in [("ON DELETE", 0usize), ("ON UPDATE", 1usize)] {
        if let Some(pos) = actions_upper.find(key) {
            let tail = actions[pos + key.len()..].trim();
            let next_on = ascii_upper(tail).find(" ON ").unwrap_or(tail.len());
            let token = tail[..next_on].trim();
            let action = ReferentialAction::parse(token).ok_or_else(|| syntax(input))?;
            if slot == 0 {
                fk.on_delete = action;
            } else {
                fk.on_update = action;
            }
        }
    }
    Ok(Some(fk))
}

fn parse_create_table(sql: &str, upper: &str) -> Result<Command> {
    let into_pos = find_keyword_top_level(upper, " INTO ", 0);
    let body_end = into_pos.unwrap_or(sql.len());
    let body = &sql["CREATE TABLE ".len()..body_end];
    let open = body.find('(').ok_or_else(|| syntax(sql))?;
    let close = matching_paren(body, open).ok_or_else(|| syntax(sql))?;
    let table = strip_ident_quotes(body[..open].trim()).to_string();
    if table.is_empty() {
        return Err(syntax(sql));
    }

    let mut schema = TableSchema::new(table);
    for raw in split_top_level(&body[open + 1..close], ',') {
        let item = raw.trim();
        if item.is_empty() {
            continue;
        }
        if let Some(fk) = parse_foreign_key_clause(item)? {
            schema.foreign_keys.push(fk);
            continue;
        }
        schema.fields.push(parse_column_def(item)?);
    }
    if schema.fields.is_empty() {
        return Err(syntax(sql));
    }

    let db = into_pos.map(|pos| sql[pos + " INTO ".len()..].trim().to_string());
    Ok(Command::CreateTable { schema, db })
}

fn parse_alter_table(sql: &str) -> Result<Command> {
    let rest = sql["ALTER TABLE ".len()..].trim();
    let space = rest.find(' ').ok_or_else(|| syntax(sql))?;
    let table = strip_ident_quotes(&rest[..space]).to_string();
    let action = rest[space + 1..].trim();
    let action_upper = ascii_upper(action);

    let op = if action_upper.starts_with("ADD INDEX") {
        let body = action["ADD INDEX".len()..].trim();
        let open = body.find('(').ok_or_else(|| syntax(sql))?;
        let close = matching_paren(body, open).ok_or_else(|| syntax(sql))?;
        AlterOp::AddIndex {
            index: body[..open].trim().to_string(),
            column: body[open + 1..close].trim().to_string(),
        }
    } else if action_upper.starts_with("ADD CONSTRAINT") || action_upper.starts_with("ADD FOREIGN KEY")
    {
        let body = action["ADD".len()..].trim();
        let fk = parse_foreign_key_clause(body)?.ok_or_else(|| syntax(sql))?;
        AlterOp::AddForeignKey { fk }
    } else if action_upper.starts_with("ADD ") {
        let offset = if action_upper.starts_with("ADD COLUMN ") {
            "ADD COLUMN ".len()
        } else {
            "ADD ".len()
        };
        let mut def = action[offset..].trim().to_string();
        let def_upper = ascii_upper(&def);
        let position = if let Some(after) = def_upper.find(" AFTER ") {
            let target = def[after + " AFTER ".len()..].trim().to_string();
            def = def[..after].trim().to_string();
            ColumnPosition::After(strip_ident_quotes(&target).to_string())
        } else if let Some(first) = def_upper.find(" FIRST") {
            def = def[..first].trim().to_string();
            ColumnPosition::First
        } else {
            ColumnPosition::Last
        };
        AlterOp::AddColumn {
            field: parse_column_def(&def)?,
            position,
        }
    } else if action_upper.starts_with("DROP COLUMN ") {
        AlterOp::DropColumn {
            column: action["DROP COLUMN ".len()..].trim().to_string(),
        }
    } else if action_upper.starts_with("DROP INDEX ") {
        AlterOp::DropIndex {
            index: action["DROP INDEX ".len()..].trim().to_string(),
        }
    } else if action_upper.starts_with("DROP FOREIGN KEY ") {
        AlterOp::DropForeignKey {
            name: action["DROP FOREIGN KEY ".len()..].trim().to_string(),
        }
    } else if action_upper.starts_with("DROP CONSTRAINT ") {
        AlterOp::DropForeignKey {
            name: action["DROP CONSTRAINT ".len()..].trim().to_string(),
        }
    } else if action_upper.starts_with("DROP ") {
        AlterOp::DropColumn {
            column: action["DROP ".len()..].trim().to_string(),
        }
    } else if action_upper.starts_with("MODIFY ") {
        let offset = if action_upper.starts_with("MODIFY COLUMN ") {
            "MODIFY COLUMN ".len()
        } else {
            "MODIFY ".len()
        };
        AlterOp::ModifyColumn {
            field: parse_column_def(action[offset..].trim())?,
        }
    } else if action_upper.starts_with("RENAME COLUMN ") {
        let body = action["RENAME COLUMN ".len()..].trim();
        let body_upper = ascii_upper(body);
        let to = body_upper.find(" TO ").ok_or_else(|| syntax(sql))?;
        AlterOp::RenameColumn {
            column: body[..to].trim().to_string(),
            new_name: body[to + 4..].trim().to_string(),
        }
    } else if action_upper.starts_with("RENAME TO ") {
        AlterOp::RenameTable {
            new_name: strip_ident_quotes(action["RENAME TO ".len()..].trim()).to_string(),
        }
    } else {
        return Err(syntax(sql));
    };

    Ok(Command::AlterTable { table, op })
}

fn parse_create_view(sql: &str, upper: &str) -> Result<Command> {
    let or_replace = upper.starts_with("CREATE OR REPLACE VIEW ");
    let prefix_len = if or_replace {
        "CREATE OR REPLACE VIEW ".len()
    } else {
        "CREATE VIEW ".len()
    };
    let rest = &sql[prefix_len..];
    let rest_upper = ascii_upper(rest);
    let as_pos = find_keyword_top_level(&rest_upper, " AS ", 0).ok_or_else(|| syntax(sql))?;
    let mut name_part = rest[..as_pos].trim().to_string();
    let body = rest[as_pos + 4..].trim().to_string();
    if body.is_empty() {
        return Err(syntax(sql));
    }

    let mut columns = Vec::new();
    if let Some(open) = name_part.find('(') {
        let close = matching_paren(&name_part, open).ok_or_else(|| syntax(sql))?;
        for col in split_top_level(&name_part[open + 1..close], ',') {
            let col = strip_ident_quotes(&col);
            if !col.is_empty() {
                columns.push(col.to_string());
            }
        }
        name_part = name_part[..open].trim().to_string();
    }
    let view = strip_ident_quotes(&name_part).to_string();
    if view.is_empty() {
        return Err(syntax(sql));
    }

    let query = match Parser::parse(&body)? {
        Command::Select { plan } => plan,
        _ => return Err(syntax(&body)),
    };
    Ok(Command::CreateView {
        view,
        columns,
        query,
        sql: body,
        or_replace,
    })
}

fn parse_insert(sql: &str, upper: &str) -> Result<Command> {
    let values_pos = find_keyword_top_level(upper, "VALUES", 0).ok_or_else(|| syntax(sql))?;
    let table_part = sql["INSERT INTO ".len()..values_pos].trim();

    let (table, columns) = if let Some(open) = table_part.find('(') {
        let close = matching_paren(table_part, open).ok_or_else(|| syntax(sql))?;
        let columns = split_top_level(&table_part[open + 1..close], ',')
            .iter()
            .map(|c| strip_ident_quotes(c).to_string())
            .filter(|c| !c.is_empty())
            .collect();
        (table_part[..open].trim().to_string(), columns)
    } else {
        (table_part.to_string(), Vec::new())
    };
    if table.is_empty() {
        return Err(syntax(sql));
    }

    let mut records = Vec::new();
    let mut cursor = values_pos + "VALUES".len();
    loop {
        let rest = &sql[cursor..];
        let open_rel = match rest.find('(') {
            Some(p) => p,
            None => break,
        };
        // Only whitespace or a separating comma may precede the tuple.
        if rest[..open_rel]
            .chars()
            .any(|c| !c.is_whitespace() && c != ',')
        {
            break;
        }
        let open = cursor + open_rel;
        let close = matching_paren(sql, open).ok_or_else(|| syntax(sql))?;
        let values = split_top_level(&sql[open + 1..close], ',')
            .iter()
            .map(|v| strip_value_quotes(v).to_string())
            .collect::<Vec<_>>();
        records.push(Record::new(values));
        cursor = close + 1;

        let after = sql[cursor..].trim_start();
        if !after.starts_with(',') {
            break;
        }
    }
    if records.is_empty() {
        return Err(syntax(sql));
    }

    let suffix = &sql[cursor..];
    let suffix_upper = ascii_upper(suffix);
    let db = find_keyword_top_level(&suffix_upper, " IN ", 0)
        .map(|pos| suffix[pos + 4..].trim().to_string())
        .filter(|s| !s.is_empty());

    Ok(Command::Insert {
        table,
        columns,
        records,
        db,
    })
}

fn parse_delete(sql: &str) -> Result<Command> {
    let rest = sql["DELETE FROM ".len()..].trim();
    let (rest, action) = take_trailing_action(rest);
    let rest_upper = ascii_upper(&rest);
    if let Some(where_pos) = find_keyword_top_level(&rest_upper, " WHERE ", 0) {
        let table = rest[..where_pos].trim().to_string();
        let conditions = parse_where_clause(&rest[where_pos + 7..])?;
        Ok(Command::Delete {
            table,
            conditions,
            action,
        })
    } else {
        Ok(Command::Delete {
            table: rest.trim().to_string(),
            conditions: Vec::new(),
            action,
        })
    }
}

fn parse_update(sql: &str, upper: &str) -> Result<Command> {
    let set_pos = find_keyword_top_level(upper, " SET ", 0).ok_or_else(|| syntax(sql))?;
    let table = sql["UPDATE ".len()..set_pos].trim().to_string();
    if table.is_empty() {
        return Err(syntax(sql));
    }
    let after_set = &sql[set_pos + 5..];
    let after_upper = ascii_upper(after_set);
    let where_pos = find_keyword_top_level(&after_upper, " WHERE ", 0);
    let assign_part = &after_set[..where_pos.unwrap_or(after_set.len())];

    let mut assignments = Vec::new();
    for pair in split_top_level(assign_part, ',') {
        let eq = pair.find('=').ok_or_else(|| syntax(&pair))?;
        let column = pair[..eq].trim().to_string();
        let value = strip_value_quotes(pair[eq + 1..].trim()).to_string();
        if column.is_empty() {
            return Err(syntax(&pair));
        }
        assignments.push((column, value));
    }
    if assignments.is_empty() {
        return Err(syntax(sql));
    }

    let conditions = match where_pos {
        Some(pos) => parse_where_clause(&after_set[pos + 7..])?,
        None => Vec::new(),
    };
    Ok(Command::Update {
        table,
        assignments,
        conditions,
    })
}

/// Try `(SELECT …)` as a nested plan.
fn parse_subquery(content: &str) -> Option<QueryPlan> {
    let content = content.trim();
    if content.len() < 2 || !content.starts_with('(') || !content.ends_with(')') {
        return None;
    }
    let inner = content[1..content.len() - 1].trim();
    if !ascii_upper(inner).starts_with("SELECT") {
        return None;
    }
    match Parser::parse(inner) {
        Ok(Command::Select { plan }) => Some(plan),
        _ => None,
    }
}

/// Split a WHERE/HAVING clause on top-level ` AND `, keeping the AND
/// that belongs to a preceding BETWEEN, then parse each conjunct.
pub(crate) fn parse_where_clause(clause: &str) -> Result<Vec<Condition>> {
    let clause = clause.trim();
    if clause.is_empty() {
        return Ok(Vec::new());
    }
    let upper = ascii_upper(clause);
    let bytes = upper.as_bytes();

    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_single = false;
    let mut in_double = false;
    let mut in_between = false;
    let mut last = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '(' if !in_single && !in_double => depth += 1,
            ')' if !in_single && !in_double => depth = (depth - 1).max(0),
            _ => {}
        }
        if depth == 0 && !in_single && !in_double {
            if bytes[i..].starts_with(b" BETWEEN") {
                in_between = true;
            }
            if bytes[i..].starts_with(b" AND ") {
                if in_between {
                    // This AND closes the BETWEEN range.
                    in_between = false;
                } else {
                    parts.push(&clause[last..i]);
                    i += 5;
                    last = i;
                    continue;
                }
            }
        }
        i += 1;
    }
    parts.push(&clause[last..]);

    let mut conditions = Vec::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        conditions.push(parse_condition(part)?);
    }
    Ok(conditions)
}

fn parse_condition(part: &str) -> Result<Condition> {
    let upper = ascii_upper(part);

    // BETWEEN lo AND hi
    if let Some(pos) = find_keyword_top_level(&upper, " BETWEEN ", 0) {
        let mut cond = Condition::new(part[..pos].trim(), CompareOp::Between, "");
        let range = part[pos + " BETWEEN ".len()..].trim();
        let range_upper = ascii_upper(range);
        let and = find_keyword_top_level(&range_upper, " AND ", 0).ok_or_else(|| syntax(part))?;
        cond.values.push(strip_value_quotes(&range[..and]).to_string());
        cond.values
            .push(strip_value_quotes(&range[and + 5..]).to_string());
        return Ok(cond);
    }

    // NOT LIKE (checked before LIKE)
    if let Some(pos) = find_keyword_top_level(&upper, " NOT LIKE ", 0) {
        let pattern = strip_value_quotes(part[pos + " NOT LIKE ".len()..].trim());
        return Ok(Condition::new(
            part[..pos].trim(),
            CompareOp::NotLike,
            pattern,
        ));
    }

    // NOT EXISTS (subquery), only at the start of the conjunct
    if upper.starts_with("NOT EXISTS ") {
        let sub = part["NOT EXISTS ".len()..].trim();
        if let Some(plan) = parse_subquery(sub) {
            let mut cond = Condition::new("", CompareOp::NotExists, "");
            cond.subquery = Some(Box::new(plan));
            return Ok(cond);
        }
        return Err(syntax(part));
    }

    // EXISTS (subquery)
    if upper.starts_with("EXISTS ") {
        let sub = part["EXISTS ".len()..].trim();
        if let Some(plan) = parse_subquery(sub) {
            let mut cond = Condition::new("", CompareOp::Exists, "");
            cond.subquery = Some(Box::new(plan));
            return Ok(cond);
        }
        return Err(syntax(part));
    }

    // LIKE
    if let Some(pos) = find_keyword_top_level(&upper, " LIKE ", 0) {
        let pattern = strip_value_quotes(part[pos + " LIKE ".len()..].trim());
        return Ok(Condition::new(part[..pos].trim(), CompareOp::Like, pattern));
    }

    // IN (list) or IN (subquery)
    let in_pos = find_keyword_top_level(&upper, " IN ", 0)
        .or_else(|| find_keyword_top_level(&upper, " IN(", 0));
    if let Some(pos) = in_pos {
        let mut cond = Condition::new(part[..pos].trim(), CompareOp::In, "");
        let open = part[pos..].find('(').map(|p| p + pos).ok_or_else(|| syntax(part))?;
        let close = matching_paren(part, open).ok_or_else(|| syntax(part))?;
        let content = &part[open..=close];
        if let Some(plan) = parse_subquery(content) {
            cond.subquery = Some(Box::new(plan));
        } else {
            let list = &content[1..content.len() - 1];
            for v in split_top_level(list, ',') {
                cond.values.push(strip_value_quotes(&v).to_string());
            }
            cond.value = list.trim().to_string();
        }
        return Ok(cond);
    }

    // Plain comparators, two-character operators first.
    const OPS: [(&str, CompareOp); 7] = [
        ("<=", CompareOp::LtEq),
        (">=", CompareOp::GtEq),
        ("!=", CompareOp::NotEq),
        ("=", CompareOp::Eq),
        ("<", CompareOp::Lt),
        (">", CompareOp::Gt),
        (" CONTAINS ", CompareOp::Contains),
    ];
    for (token, op) in OPS {
        if let Some(pos) = find_keyword_top_level(&upper, token, 0) {
            let mut cond = Condition::new(part[..pos].trim(), op, "");
            let rhs = part[pos + token.len()..].trim();
            if rhs.starts_with('(') && rhs.ends_with(')') {
                if let Some(plan) = parse_subquery(rhs) {
                    cond.subquery = Some(Box::new(plan));
                    return Ok(cond);
                }
            }
            cond.value = strip_value_quotes(rhs).to_string();
            return Ok(cond);
        }
    }

    Err(syntax(part))
}

struct JoinMatch {
    pos: usize,
    keyword_len: usize,
    join_type: JoinType,
    natural: bool,
}

const JOIN_KEYWORDS: [(&str, JoinType, bool); 8] = [
    (" NATURAL LEFT JOIN ", JoinType::Left, true),
    (" NATURAL RIGHT JOIN ", JoinType::Right, true),
    (" NATURAL INNER JOIN ", JoinType::Inner, true),
    (" NATURAL JOIN ", JoinType::Inner, true),
    (" LEFT JOIN ", JoinType::Left, false),
    (" RIGHT JOIN ", JoinType::Right, false),
    (" INNER JOIN ", JoinType::Inner, false),
    (" JOIN ", JoinType::Inner, false),
];

/// Find the last top-level join between `start` and `end`, counting
/// how many there are. Longer (NATURAL) forms shadow their suffixes.
fn find_last_join(upper: &str, start: usize, end: usize) -> (Option<JoinMatch>, usize) {
    let bytes = upper.as_bytes();
    let mut depth = 0i32;
    let mut in_single = false;
    let mut in_double = false;
    let mut found: Option<JoinMatch> = None;
    let mut count = 0usize;
    let mut i = start;
    while i < end {
        let c = bytes[i] as char;
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            _ => {}
        }
        if !in_single && !in_double {
            if c == '(' {
                depth += 1;
            } else if c == ')' {
                depth = (depth - 1).max(0);
            }
            if depth == 0 {
                for (kw, join_type, natural) in JOIN_KEYWORDS {
                    if i + kw.len() <= end && bytes[i..].starts_with(kw.as_bytes()) {
                        found = Some(JoinMatch {
                            pos: i,
                            keyword_len: kw.len(),
                            join_type,
                            natural,
                        });
                        count += 1;
                        i += kw.len() - 1;
                        break;
                    }
                }
            }
        }
        i += 1;
    }
    (found, count)
}

/// Split `name [AS] alias` at top level.
fn split_name_alias(clause: &str) -> (String, Option<String>) {
    let clause = clause.trim();
    let upper = ascii_upper(clause);
    if let Some(as_pos) = find_keyword_top_level(&upper, " AS ", 0) {
        return (
            strip_ident_quotes(clause[..as_pos].trim()).to_string(),
            Some(clause[as_pos + 4..].trim().to_string()),
        );
    }
    if let Some(space) = last_top_level_space(clause) {
        return (
            strip_ident_quotes(clause[..space].trim()).to_string(),
            Some(clause[space + 1..].trim().to_string()),
        );
    }
    (strip_ident_quotes(clause).to_string(), None)
}

fn parse_select(sql: &str, upper: &str) -> Result<QueryPlan> {
    let from_pos = find_keyword_top_level(upper, " FROM ", 0).ok_or_else(|| syntax(sql))?;
    let mut plan = QueryPlan::default();

    // 1. SELECT list
    let proj_str = &sql["SELECT".len()..from_pos];
    for raw in split_top_level(proj_str, ',') {
        let item = raw.trim();
        if item.is_empty() {
            continue;
        }
        let item_upper = ascii_upper(item);
        let (expr, alias) = if let Some(as_pos) = find_keyword_top_level(&item_upper, " AS ", 0) {
            (
                item[..as_pos].trim().to_string(),
                Some(item[as_pos + 4..].trim().to_string()),
            )
        } else if let Some(space) = last_top_level_space(item) {
            (
                item[..space].trim().to_string(),
                Some(item[space + 1..].trim().to_string()),
            )
        } else {
            (item.to_string(), None)
        };

        // Aggregate function?
        let mut parsed = None;
        if let (Some(open), Some(close)) = (expr.find('('), expr.rfind(')')) {
            if close > open {
                if let Some(func) = AggregateFunc::parse(&expr[..open]) {
                    let mut field = expr[open + 1..close].trim().to_string();
                    if field.is_empty() {
                        field = "*".to_string();
                    }
                    parsed = Some(SelectItem::Aggregate(AggregateExpr { func, field }));
                }
            }
        }
        // Scalar subquery?
        if parsed.is_none() && expr.starts_with('(') && expr.ends_with(')') {
            if let Some(sub) = parse_subquery(&expr) {
                parsed = Some(SelectItem::Subquery(Box::new(sub)));
            }
        }
        let item = parsed.unwrap_or_else(|| {
            plan.projection.push(expr.clone());
            plan.projection_aliases.push(alias.clone());
            SelectItem::Column(expr.clone())
        });
        plan.select_exprs.push(SelectExpr { item, alias });
    }
    if plan.select_exprs.is_empty() {
        return Err(syntax(sql));
    }

    // 2. Clause boundaries
    let start_rest = from_pos + " FROM ".len();
    let where_pos = find_keyword_top_level(upper, " WHERE ", start_rest);
    let group_pos = find_keyword_top_level(upper, " GROUP BY ", start_rest);
    let having_pos = find_keyword_top_level(upper, " HAVING ", start_rest);
    let order_pos = find_keyword_top_level(upper, " ORDER BY ", start_rest);
    let end_from = [where_pos, group_pos, having_pos, order_pos]
        .iter()
        .flatten()
        .copied()
        .min()
        .unwrap_or(sql.len());

    // 3. FROM and JOIN
    let (last_join, join_count) = find_last_join(upper, start_rest, end_from);
    if let Some(join) = &last_join {
        if join_count > 1 {
            // Chained joins: everything left of the last join becomes a
            // derived source re-parsed as its own SELECT.
            let left_clause = sql[start_rest..join.pos].trim();
            let derived_sql = format!("SELECT * FROM {left_clause}");
            let derived = match Parser::parse(&derived_sql)? {
                Command::Select { plan } => plan,
                _ => return Err(syntax(sql)),
            };
            plan.source_subquery = Some(Box::new(derived));
        } else {
            let source_clause = sql[start_rest..join.pos].trim();
            parse_from_source(&mut plan, source_clause, sql)?;
        }

        let right_raw = &sql[join.pos..end_from];
        let right_upper = ascii_upper(right_raw);
        if join.natural {
            let t2_clause = right_raw[join.keyword_len..].trim();
            let (table, alias) = split_name_alias(t2_clause);
            plan.join = Some(JoinClause {
                table,
                alias,
                join_type: join.join_type,
                natural: true,
                on_left: String::new(),
                on_right: String::new(),
            });
        } else {
            let on_pos =
                find_keyword_top_level(&right_upper, " ON ", 0).ok_or_else(|| syntax(sql))?;
            let t2_clause = right_raw[join.keyword_len..on_pos].trim();
            let (table, alias) = split_name_alias(t2_clause);
            let on_cond = right_raw[on_pos + 4..].trim();
            let eq = on_cond.find('=').ok_or_else(|| syntax(on_cond))?;
            plan.join = Some(JoinClause {
                table,
                alias,
                join_type: join.join_type,
                natural: false,
                on_left: on_cond[..eq].trim().to_string(),
                on_right: on_cond[eq + 1..].trim().to_string(),
            });
        }
    } else {
        let source_clause = sql[start_rest..end_from].trim();
        parse_from_source(&mut plan, source_clause, sql)?;
    }

    // 4. WHERE
    if let Some(pos) = where_pos {
        let end = [group_pos, having_pos, order_pos]
            .iter()
            .flatten()
            .copied()
            .filter(|p| *p > pos)
            .min()
            .unwrap_or(sql.len());
        plan.conditions = parse_where_clause(&sql[pos + 7..end])?;
    }

    // 5. GROUP BY
    if let Some(pos) = group_pos {
        let end = [having_pos, order_pos]
            .iter()
            .flatten()
            .copied()
            .filter(|p| *p > pos)
            .min()
            .unwrap_or(sql.len());
        for col in split_top_level(&sql[pos + " GROUP BY ".len()..end], ',') {
            let col = col.trim();
            if !col.is_empty() {
                plan.group_by.push(col.to_string());
            }
        }
    }

    // 6. HAVING
    if let Some(pos) = having_pos {
        let end = order_pos.filter(|p| *p > pos).unwrap_or(sql.len());
        plan.having = parse_where_clause(&sql[pos + " HAVING ".len()..end])?;
    }

    // 7. ORDER BY
    if let Some(pos) = order_pos {
        for raw in split_top_level(&sql[pos + " ORDER BY ".len()..], ',') {
            let mut part = raw.trim().to_string();
            if part.is_empty() {
                continue;
            }
            let part_upper = ascii_upper(&part);
            let mut ascending = true;
            if part_upper.ends_with(" DESC") {
                ascending = false;
                part = part[..part.len() - 5].trim().to_string();
            } else if part_upper.ends_with(" ASC") {
                part = part[..part.len() - 4].trim().to_string();
            }
            if !part.is_empty() {
                plan.order_by.push((part, ascending));
            }
        }
    }

    Ok(plan)
}

/// Parse the FROM source: a table (with optional alias) or a
/// parenthesized subquery, which must carry an alias.
fn parse_from_source(plan: &mut QueryPlan, clause: &str, whole: &str) -> Result<()> {
    let clause = clause.trim();
    if clause.is_empty() {
        return Err(syntax(whole));
    }
    if clause.starts_with('(') {
        if let Some(close) = matching_paren(clause, 0) {
            if let Some(sub) = parse_subquery(&clause[..=close]) {
                let remainder = clause[close + 1..].trim();
                if remainder.is_empty() {
                    return Err(Error::Syntax(format!(
                        "subquery in FROM clause must have an alias: {clause}"
                    )));
                }
                let alias = if ascii_upper(remainder).starts_with("AS ") {
                    remainder[3..].trim().to_string()
                } else {
                    remainder.to_string()
                };
                plan.source_subquery = Some(Box::new(sub));
                plan.source_alias = Some(alias);
                return Ok(());
            }
        }
        return Err(syntax(clause));
    }
    let (table, alias) = split_name_alias(clause);
    if table.is_empty() {
        return Err(syntax(whole));
    }
    plan.source_table = Some(table);
    plan.source_alias = alias;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select_plan(sql: &str) -> QueryPlan {
        match Parser::parse(sql).unwrap() {
            Command::Select { plan } => plan,
            other => panic!("expected SELECT, got {other:?}"),
        }
    }

    #[test]
    fn test_create_table_with_constraints() {
        let cmd = Parser::parse(
            "CREATE TABLE child(id int primary key, pid int, name char[8] NOT NULL, \
             CONSTRAINT fk FOREIGN KEY(pid) REFERENCES parent(id) ON DELETE CASCADE)",
        )
        .unwrap();
        let Command::CreateTable { schema, db } = cmd else {
            panic!("wrong command");
        };
        assert_eq!(db, None);
        assert_eq!(schema.name, "child");
        assert_eq!(schema.fields.len(), 3);
        assert!(schema.fields[0].is_key);
        assert!(!schema.fields[0].nullable);
        assert!(!schema.fields[2].nullable);
        assert_eq!(schema.fields[2].size, 8);
        assert_eq!(schema.foreign_keys.len(), 1);
        let fk = &schema.foreign_keys[0];
        assert_eq!(fk.name, "fk");
        assert_eq!(fk.columns, vec!["pid"]);
        assert_eq!(fk.ref_table, "parent");
        assert_eq!(fk.ref_columns, vec!["id"]);
        assert_eq!(fk.on_delete, ReferentialAction::Cascade);
        assert_eq!(fk.on_update, ReferentialAction::Restrict);
    }

    #[test]
    fn test_create_table_into_db() {
        let cmd = Parser::parse("CREATE TABLE t (id int) INTO shop").unwrap();
        let Command::CreateTable { db, .. } = cmd else {
            panic!("wrong command");
        };
        assert_eq!(db.as_deref(), Some("shop"));
    }

    #[test]
    fn test_insert_multi_row_with_columns() {
        let cmd =
            Parser::parse("INSERT INTO t (id, name) VALUES(1,'a'),(2,'b, with comma')").unwrap();
        let Command::Insert {
            table,
            columns,
            records,
            db,
        } = cmd
        else {
            panic!("wrong command");
        };
        assert_eq!(table, "t");
        assert_eq!(columns, vec!["id", "name"]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].values, vec!["1", "a"]);
        assert_eq!(records[1].values, vec!["2", "b, with comma"]);
        assert_eq!(db, None);
    }

    #[test]
    fn test_insert_into_named_db() {
        let cmd = Parser::parse("INSERT INTO t VALUES(1,'a') IN shop").unwrap();
        let Command::Insert { db, .. } = cmd else {
            panic!("wrong command");
        };
        assert_eq!(db.as_deref(), Some("shop"));
    }

    #[test]
    fn test_select_projection_aliases_and_order() {
        let plan = select_plan("SELECT id AS key, name FROM t ORDER BY key DESC, name ASC");
        assert_eq!(plan.source_table.as_deref(), Some("t"));
        assert_eq!(plan.projection, vec!["id", "name"]);
        assert_eq!(plan.projection_aliases[0].as_deref(), Some("key"));
        assert_eq!(plan.order_by, vec![("key".to_string(), false), ("name".to_string(), true)]);
    }

    #[test]
    fn test_select_where_ops() {
        let plan = select_plan(
            "SELECT * FROM t WHERE a = 1 AND b BETWEEN 2 AND 5 AND c LIKE '%x%' \
             AND d NOT LIKE 'y%' AND e IN (1, 2) AND f CONTAINS 'z'",
        );
        let ops: Vec<CompareOp> = plan.conditions.iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                CompareOp::Eq,
                CompareOp::Between,
                CompareOp::Like,
                CompareOp::NotLike,
                CompareOp::In,
                CompareOp::Contains
            ]
        );
        assert_eq!(plan.conditions[1].values, vec!["2", "5"]);
        assert_eq!(plan.conditions[4].values, vec!["1", "2"]);
    }

    #[test]
    fn test_between_keeps_following_and() {
        let plan = select_plan("SELECT * FROM t WHERE a BETWEEN 1 AND 9 AND b = 2");
        assert_eq!(plan.conditions.len(), 2);
        assert_eq!(plan.conditions[0].op, CompareOp::Between);
        assert_eq!(plan.conditions[1].field, "b");
    }

    #[test]
    fn test_subquery_in_where() {
        let plan = select_plan("SELECT * FROM t WHERE id IN (SELECT tid FROM u WHERE x = 1)");
        assert_eq!(plan.conditions.len(), 1);
        let sub = plan.conditions[0].subquery.as_ref().unwrap();
        assert_eq!(sub.source_table.as_deref(), Some("u"));
        assert_eq!(sub.conditions.len(), 1);
    }

    #[test]
    fn test_exists_subquery() {
        let plan = select_plan("SELECT * FROM t WHERE EXISTS (SELECT id FROM u)");
        assert_eq!(plan.conditions[0].op, CompareOp::Exists);
        assert!(plan.conditions[0].subquery.is_some());
        let plan = select_plan("SELECT * FROM t WHERE NOT EXISTS (SELECT id FROM u)");
        assert_eq!(plan.conditions[0].op, CompareOp::NotExists);
    }

    #[test]
    fn test_scalar_subquery_rhs() {
        let plan = select_plan("SELECT * FROM t WHERE id = (SELECT MAX(id) FROM t)");
        assert_eq!(plan.conditions[0].op, CompareOp::Eq);
        assert!(plan.conditions[0].subquery.is_some());
    }

    #[test]
    fn test_from_subquery_requires_alias() {
        let err = Parser::parse("SELECT * FROM (SELECT id FROM t)").unwrap_err();
        assert!(matches!(err, Error::Syntax(_)));
        let plan = select_plan("SELECT * FROM (SELECT id FROM t) s WHERE s.id = 1");
        assert!(plan.source_subquery.is_some());
        assert_eq!(plan.source_alias.as_deref(), Some("s"));
    }

    #[test]
    fn test_join_with_aliases() {
        let plan = select_plan(
            "SELECT a.id, b.name FROM t1 AS a LEFT JOIN t2 AS b ON a.id = b.tid WHERE b.x = 1",
        );
        assert_eq!(plan.source_table.as_deref(), Some("t1"));
        assert_eq!(plan.source_alias.as_deref(), Some("a"));
        let join = plan.join.unwrap();
        assert_eq!(join.table, "t2");
        assert_eq!(join.alias.as_deref(), Some("b"));
        assert_eq!(join.join_type, JoinType::Left);
        assert_eq!(join.on_left, "a.id");
        assert_eq!(join.on_right, "b.tid");
    }

    #[test]
    fn test_natural_join() {
        let plan = select_plan("SELECT * FROM r NATURAL JOIN s");
        let join = plan.join.unwrap();
        assert!(join.natural);
        assert_eq!(join.join_type, JoinType::Inner);
        assert_eq!(join.table, "s");
    }

    #[test]
    fn test_chained_joins_become_derived_source() {
        let plan = select_plan(
            "SELECT * FROM a JOIN b ON a.id = b.aid JOIN c ON b.id = c.bid",
        );
        assert!(plan.source_subquery.is_some());
        let join = plan.join.unwrap();
        assert_eq!(join.table, "c");
        assert_eq!(join.on_left, "b.id");
    }

    #[test]
    fn test_aggregates_group_having() {
        let plan = select_plan(
            "SELECT dept, COUNT(*) AS cnt FROM emp GROUP BY dept HAVING COUNT(*) > 2",
        );
        assert_eq!(plan.group_by, vec!["dept"]);
        assert_eq!(plan.aggregates().len(), 1);
        assert_eq!(plan.having.len(), 1);
        assert_eq!(plan.having[0].field, "COUNT(*)");
        assert_eq!(plan.having[0].op, CompareOp::Gt);
        let agg = plan.aggregates()[0];
        assert_eq!(agg.func, AggregateFunc::Count);
        assert_eq!(agg.field, "*");
    }

    #[test]
    fn test_update_and_delete() {
        let cmd = Parser::parse("UPDATE t SET name = 'x', age = 3 WHERE id = 1").unwrap();
        let Command::Update {
            table,
            assignments,
            conditions,
        } = cmd
        else {
            panic!("wrong command");
        };
        assert_eq!(table, "t");
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0], ("name".to_string(), "x".to_string()));
        assert_eq!(conditions.len(), 1);

        let cmd = Parser::parse("DELETE FROM t WHERE id = 1 CASCADE").unwrap();
        let Command::Delete {
            table,
            conditions,
            action,
        } = cmd
        else {
            panic!("wrong command");
        };
        assert_eq!(table, "t");
        assert_eq!(conditions.len(), 1);
        assert_eq!(action, Some(ReferentialAction::Cascade));
    }

    #[test]
    fn test_alter_variants() {
        let cmd = Parser::parse("ALTER TABLE t ADD COLUMN age int NOT NULL AFTER id").unwrap();
        let Command::AlterTable { op, .. } = cmd else {
            panic!("wrong command");
        };
        let AlterOp::AddColumn { field, position } = op else {
            panic!("wrong op");
        };
        assert_eq!(field.name, "age");
        assert!(!field.nullable);
        assert_eq!(position, ColumnPosition::After("id".to_string()));

        let cmd = Parser::parse("ALTER TABLE t DROP COLUMN age").unwrap();
        assert!(matches!(
            cmd,
            Command::AlterTable {
                op: AlterOp::DropColumn { .. },
                ..
            }
        ));

        let cmd = Parser::parse("ALTER TABLE t RENAME TO u").unwrap();
        assert!(matches!(
            cmd,
            Command::AlterTable {
                op: AlterOp::RenameTable { .. },
                ..
            }
        ));

        let cmd =
            Parser::parse("ALTER TABLE t ADD FOREIGN KEY (pid) REFERENCES p(id) ON UPDATE SET NULL")
                .unwrap();
        let Command::AlterTable {
            op: AlterOp::AddForeignKey { fk },
            ..
        } = cmd
        else {
            panic!("wrong op");
        };
        assert_eq!(fk.on_update, ReferentialAction::SetNull);
    }

    #[test]
    fn test_create_view() {
        let cmd =
            Parser::parse("CREATE OR REPLACE VIEW v (a, b) AS SELECT id, name FROM t").unwrap();
        let Command::CreateView {
            view,
            columns,
            query,
            sql,
            or_replace,
        } = cmd
        else {
            panic!("wrong command");
        };
        assert_eq!(view, "v");
        assert!(or_replace);
        assert_eq!(columns, vec!["a", "b"]);
        assert_eq!(query.projection, vec!["id", "name"]);
        assert_eq!(sql, "SELECT id, name FROM t");
    }

    #[test]
    fn test_transaction_commands() {
        assert_eq!(Parser::parse("BEGIN").unwrap(), Command::Begin);
        assert_eq!(Parser::parse("start transaction").unwrap(), Command::Begin);
        assert_eq!(Parser::parse("COMMIT").unwrap(), Command::Commit);
        assert_eq!(Parser::parse("ROLLBACK").unwrap(), Command::Rollback);
        assert_eq!(
            Parser::parse("SAVEPOINT s1").unwrap(),
            Command::Savepoint {
                name: "s1".to_string()
            }
        );
        assert_eq!(
            Parser::parse("ROLLBACK TO SAVEPOINT s1").unwrap(),
            Command::RollbackToSavepoint {
                name: "s1".to_string()
            }
        );
        assert_eq!(
            Parser::parse("RELEASE SAVEPOINT s1").unwrap(),
            Command::ReleaseSavepoint {
                name: "s1".to_string()
            }
        );
        assert_eq!(Parser::parse("CHECKPOINT").unwrap(), Command::Checkpoint);
    }

    #[test]
    fn test_grant_all_expands() {
        let cmd = Parser::parse("GRANT ALL ON t TO bob").unwrap();
        let Command::Grant { privileges, .. } = cmd else {
            panic!("wrong command");
        };
        assert_eq!(privileges.len(), 6);
        assert!(privileges.contains(&"SELECT".to_string()));
    }

    #[test]
    fn test_script_splitting_and_comments() {
        let cmds = Parser::parse_script(
            "-- setup\nCREATE TABLE t (id int); /* data */ INSERT INTO t VALUES(1); # done",
        )
        .unwrap();
        assert_eq!(cmds.len(), 2);
    }

    #[test]
    fn test_unrecognized_statement() {
        let err = Parser::parse("FROB THE KNOB").unwrap_err();
        match err {
            Error::Syntax(fragment) => assert!(fragment.contains("FROB")),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn test_keywords_inside_strings_are_data() {
        let plan = select_plan("SELECT * FROM t WHERE name = ' WHERE FROM AND '");
        assert_eq!(plan.conditions.len(), 1);
        assert_eq!(plan.conditions[0].value, " WHERE FROM AND ");
    }
}
