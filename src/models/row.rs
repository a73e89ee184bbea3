use bytes::Bytes;

/// 上报CSV表头
pub const CSV_HEADER: [&str; 4] = ["IP", "VRF", "VM Name", "VM Tags"];

/// 一条导出行：地址、网段标签、实例名、标签串
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowRecord {
    pub address: String,
    pub segment: String,
    pub name: String,
    pub tags: String,
}

impl RowRecord {
    pub fn fields(&self) -> [&str; 4] {
        [&self.address, &self.segment, &self.name, &self.tags]
    }
}

/// 累积中的行批次
///
/// 只由批量导出器的单一任务持有和修改，不需要加锁
#[derive(Debug, Default)]
pub struct Batch {
    rows: Vec<RowRecord>,
    dirty: bool,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: RowRecord) {
        self.rows.push(row);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 序列化为带表头的CSV
    pub fn render(&self) -> Bytes {
        render_csv(&self.rows)
    }

    /// 上传成功后清空，回到只有表头的状态
    pub fn reset(&mut self) {
        self.rows.clear();
        self.dirty = false;
    }
}

/// 将若干行序列化为带表头的CSV
pub fn render_csv<'a, I>(rows: I) -> Bytes
where
    I: IntoIterator<Item = &'a RowRecord>,
{
    let mut out = String::new();
    write_record(&mut out, &CSV_HEADER);
    for row in rows {
        write_record(&mut out, &row.fields());
    }
    Bytes::from(out)
}

fn write_record(out: &mut String, fields: &[&str]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_field(out, field);
    }
    out.push('\n');
}

fn write_field(out: &mut String, field: &str) {
    if !needs_quotes(field) {
        out.push_str(field);
        return;
    }
    out.push('"');
    for c in field.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
}

fn needs_quotes(field: &str) -> bool {
    field.starts_with(char::is_whitespace) || field.contains([',', '"', '\r', '\n'])
}
