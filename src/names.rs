//! Volume file name successor functions.
//!
//! Two naming conventions exist: the new style embeds a decimal volume
//! number in the name (`name.part002.rar`, `vol003.rar`), the old style
//! counts in the three-character extension (`.rar`, `.r00`, `.r01`, ...).

/// Returns the next volume name under the new naming scheme.
///
/// Finds the maximal runs of decimal digits in the name. With two or more
/// runs the name is assumed to be `name.part###of###.rar` style: the
/// second-to-last run is the volume number, unless a `.` sits between the
/// last two runs or no `.` precedes them, in which case the last run is
/// used. The chosen run is incremented as a decimal number, zero-padded to
/// at least its original width.
pub(crate) fn next_new_vol_name(file: &str) -> String {
    // collect [start, end) pairs of each digit run
    let mut runs: Vec<usize> = Vec::new();
    let mut in_digit = false;
    for (i, c) in file.char_indices() {
        if c.is_ascii_digit() {
            if !in_digit {
                runs.push(i);
                in_digit = true;
            }
        } else if in_digit {
            runs.push(i);
            in_digit = false;
        }
    }
    if in_digit {
        runs.push(file.len());
    }
    if runs.is_empty() {
        return file.to_string();
    }
    let mut m: &[usize] = &runs;
    if m.len() >= 4 {
        // Assume name.part###of###.rar style, where the first of the last
        // two runs is the volume number. The style is rejected if a '.'
        // sits between the two runs or no '.' precedes the first.
        m = &m[m.len() - 4..];
        if file[m[1]..m[2]].contains('.') || !file[..m[0]].contains('.') {
            m = &m[2..];
        }
    }
    let (lo, hi) = (m[0], m[1]);
    let n: u64 = file[lo..hi].parse().map_or(0, |n: u64| n + 1);
    let vol = format!("{:0width$}", n, width = hi - lo);
    format!("{}{}{}", &file[..lo], vol, &file[hi..])
}

/// Returns the next volume name under the old naming scheme.
///
/// The two trailing characters of the extension form a decimal counter;
/// rolling over position 1 bumps the first extension character (digit
/// first, then letters, so `.r99` is followed by `.s00`). Extensions not of
/// the form `<any><digit><digit>` are reset to `<first char>00`.
pub(crate) fn next_old_vol_name(file: &str) -> String {
    let i = file.rfind('.').map_or(file.len(), |i| i);
    let ext = file[i..].as_bytes();
    // ext[0] is the '.' when present
    if ext.len() < 4 || !ext[2].is_ascii_digit() || !ext[3].is_ascii_digit() {
        let keep = file.len().min(i + 2);
        return format!("{}00", &file[..keep]);
    }
    let mut b: Vec<u8> = ext[1..4].to_vec();
    for j in (0..3).rev() {
        if b[j] != b'9' {
            b[j] += 1;
            break;
        }
        if j == 0 {
            // carry out of the counter bumps into letters
            b[j] = b'A';
        } else {
            b[j] = b'0';
        }
    }
    format!("{}.{}", &file[..i], String::from_utf8_lossy(&b))
}

/// Normalises the first volume's extension: no extension gains `.rar`,
/// empty and self-extracting extensions are replaced by `rar`.
pub(crate) fn fix_file_extension(file: &str) -> String {
    let Some(i) = file.rfind('.') else {
        return format!("{}.rar", file);
    };
    let ext = file[i + 1..].to_ascii_lowercase();
    if ext.is_empty() || ext == "exe" || ext == "sfx" {
        return format!("{}rar", &file[..i + 1]);
    }
    file.to_string()
}

pub(crate) fn has_digits(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_new_part_style() {
        assert_eq!(next_new_vol_name("test.part001.rar"), "test.part002.rar");
        assert_eq!(next_new_vol_name("test.part009.rar"), "test.part010.rar");
        assert_eq!(next_new_vol_name("test.part999.rar"), "test.part1000.rar");
    }

    #[test]
    fn test_next_new_single_run() {
        assert_eq!(next_new_vol_name("vol001.rar"), "vol002.rar");
        assert_eq!(next_new_vol_name("archive7.rar"), "archive8.rar");
    }

    #[test]
    fn test_next_new_part_of_style() {
        // second-to-last run is the volume number
        assert_eq!(
            next_new_vol_name("name.part001of100.rar"),
            "name.part002of100.rar"
        );
        // a dot between the runs disqualifies the style; last run is used
        assert_eq!(next_new_vol_name("a2.b.part001.x9.rar"), "a2.b.part001.x10.rar");
    }

    #[test]
    fn test_next_new_repeated_increment() {
        let mut name = "x.part098.rar".to_string();
        for _ in 0..5 {
            name = next_new_vol_name(&name);
        }
        assert_eq!(name, "x.part103.rar");
    }

    #[test]
    fn test_next_old_counter() {
        assert_eq!(next_old_vol_name("test.rar"), "test.r00");
        assert_eq!(next_old_vol_name("test.r00"), "test.r01");
        assert_eq!(next_old_vol_name("test.r09"), "test.r10");
        assert_eq!(next_old_vol_name("test.r99"), "test.s00");
        assert_eq!(next_old_vol_name("test.999"), "test.A00");
    }

    #[test]
    fn test_next_old_resets_bad_extension() {
        assert_eq!(next_old_vol_name("test.txt"), "test.t00");
        assert_eq!(next_old_vol_name("test.r1x"), "test.r00");
    }

    #[test]
    fn test_fix_file_extension() {
        assert_eq!(fix_file_extension("archive"), "archive.rar");
        assert_eq!(fix_file_extension("archive."), "archive.rar");
        assert_eq!(fix_file_extension("archive.exe"), "archive.rar");
        assert_eq!(fix_file_extension("archive.SFX"), "archive.rar");
        assert_eq!(fix_file_extension("archive.rar"), "archive.rar");
        assert_eq!(fix_file_extension("archive.r00"), "archive.r00");
    }
}
